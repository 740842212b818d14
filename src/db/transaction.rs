//! Transaction manager: the single owner of transaction state for one unit of work.
//!
//! A [`TransactionManager`] wraps a [`ConnectionProvider`], lazily begins at most one
//! transaction, and commits or rolls it back exactly once. All statement execution goes
//! through [`TransactionManager::execute`], which either runs inside the ambient transaction
//! or wraps the call in its own.
//!
//! State machine:
//!
//! ```text
//! NoTransaction --begin--> Active --commit--> Committed
//!                            |
//!                            +----rollback--> RolledBack
//! ```
//!
//! Begin is allowed again from any non-active state. A failed commit or rollback leaves the
//! manager in `NoTransaction`. After a failed commit the native transaction is rolled back,
//! or the connection is marked broken when that is not possible. A failed rollback marks the
//! connection broken.
//!
//! A transaction whose connection broke (timeout, lost socket) is gone. The next call through
//! the manager reports it with a connection error and drops the state to `NoTransaction`,
//! instead of silently running on a fresh connection outside any transaction.

use crate::db::connection::DbConnection;
use crate::db::diagnostic::build_final_query;
use crate::db::provider::ConnectionProvider;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionState, DatabaseType, ExecutionContext, IsolationLevel, ParameterSet, SessionInfo,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// An active native transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionHandle {
    id: String,
    isolation_level: IsolationLevel,
    db_type: DatabaseType,
    started_at: DateTime<Utc>,
}

impl TransactionHandle {
    fn new(isolation_level: IsolationLevel, db_type: DatabaseType) -> Self {
        Self {
            id: generate_transaction_id(),
            isolation_level,
            db_type,
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Transaction state held by a manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    Active(TransactionHandle),
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn handle(&self) -> Option<&TransactionHandle> {
        match self {
            Self::Active(handle) => Some(handle),
            _ => None,
        }
    }
}

enum ProviderSlot<'p> {
    Owned(ConnectionProvider),
    Borrowed(&'p mut ConnectionProvider),
}

impl ProviderSlot<'_> {
    fn get(&mut self) -> &mut ConnectionProvider {
        match self {
            ProviderSlot::Owned(provider) => provider,
            ProviderSlot::Borrowed(provider) => provider,
        }
    }

    fn get_ref(&self) -> &ConnectionProvider {
        match self {
            ProviderSlot::Owned(provider) => provider,
            ProviderSlot::Borrowed(provider) => provider,
        }
    }
}

fn disposed_error() -> DbError {
    DbError::internal("Transaction manager has already been disposed")
}

/// Owns the transaction boundaries of one logical unit of work.
///
/// One manager is one in-flight unit of work: calls must be made sequentially by a single
/// caller. Distinct managers over distinct connections are independent.
pub struct TransactionManager<'p> {
    context: ExecutionContext,
    /// `None` only while `dispose` is running
    provider: Option<ProviderSlot<'p>>,
    state: TransactionState,
}

impl std::fmt::Debug for TransactionManager<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("connection", &self.context.masked_connection_string())
            .field("owns_provider", &self.owns_provider())
            .field("state", &self.state)
            .finish()
    }
}

impl TransactionManager<'static> {
    /// Manager with its own provider; disposing the manager disposes the provider.
    pub fn create_owned(context: ExecutionContext) -> Self {
        let provider = ConnectionProvider::create_owned(&context);
        Self {
            context,
            provider: Some(ProviderSlot::Owned(provider)),
            state: TransactionState::NoTransaction,
        }
    }
}

impl<'p> TransactionManager<'p> {
    /// Manager over a caller-supplied provider, which it never disposes.
    pub fn wrap_existing(provider: &'p mut ConnectionProvider, context: ExecutionContext) -> Self {
        Self {
            context,
            provider: Some(ProviderSlot::Borrowed(provider)),
            state: TransactionState::NoTransaction,
        }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn owns_provider(&self) -> bool {
        matches!(self.provider, Some(ProviderSlot::Owned(_)))
    }

    pub fn state(&self) -> &TransactionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn current_transaction(&self) -> Option<&TransactionHandle> {
        self.state.handle()
    }

    /// Session identifiers of the underlying connection, once opened.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.provider.as_ref().and_then(|slot| slot.get_ref().session())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.provider
            .as_ref()
            .map(|slot| slot.get_ref().state())
            .unwrap_or(ConnectionState::Closed)
    }

    fn provider_mut(&mut self) -> DbResult<&mut ConnectionProvider> {
        self.provider
            .as_mut()
            .map(ProviderSlot::get)
            .ok_or_else(disposed_error)
    }

    /// Begin a transaction at the context's isolation level.
    ///
    /// Returns the active handle unchanged when a transaction is already running.
    pub async fn begin_transaction(&mut self) -> DbResult<&TransactionHandle> {
        if !self.state.is_active() {
            let level = self.context.isolation_level();
            let masked = self.context.masked_connection_string();
            let provider = self.provider_mut()?;

            if let Err(e) = provider.begin_transaction(level).await {
                error!(
                    connection = %masked,
                    isolation_level = %level,
                    error = %e,
                    "Failed to begin transaction"
                );
                return Err(e);
            }

            let db_type = provider.connection()?.db_type();
            let handle = TransactionHandle::new(level, db_type);
            trace!(
                transaction_id = %handle.id,
                connection = %masked,
                isolation_level = %level,
                "Transaction started"
            );
            self.state = TransactionState::Active(handle);
        }

        self.state
            .handle()
            .ok_or_else(|| DbError::internal("Transaction state lost after begin"))
    }

    /// Commit the active transaction. No-op when none is active.
    ///
    /// The handle is cleared whatever the outcome. When `COMMIT` fails the transaction is
    /// rolled back before the error is returned, so nothing stays open on the connection.
    pub async fn commit(&mut self) -> DbResult<()> {
        let handle = match std::mem::replace(&mut self.state, TransactionState::NoTransaction) {
            TransactionState::Active(handle) => handle,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        let provider = self.provider_mut()?;
        let result = match provider.connection() {
            Ok(conn) => conn.commit().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                provider.drain_server_messages().await;
                trace!(transaction_id = %handle.id, "Transaction committed");
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(e) => {
                error!(transaction_id = %handle.id, error = %e, "Commit failed");
                release_failed_commit(provider, &handle.id, &e).await;
                Err(DbError::commit(handle.id, e.to_string()))
            }
        }
    }

    /// Roll back the active transaction. No-op when none is active.
    ///
    /// Same contract as [`commit`](Self::commit): failures are logged, the connection is
    /// marked broken, and the error is returned.
    pub async fn rollback(&mut self) -> DbResult<()> {
        let handle = match std::mem::replace(&mut self.state, TransactionState::NoTransaction) {
            TransactionState::Active(handle) => handle,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        let provider = self.provider_mut()?;
        let result = match provider.connection() {
            Ok(conn) => conn.rollback().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                warn!(transaction_id = %handle.id, "Transaction rolled back");
                self.state = TransactionState::RolledBack;
                Ok(())
            }
            Err(e) => {
                provider.mark_broken();
                error!(transaction_id = %handle.id, error = %e, "Rollback failed");
                Err(DbError::rollback(handle.id, e.to_string()))
            }
        }
    }

    /// Run `callback` against the live connection.
    ///
    /// With `starts_new_transaction` the call begins a transaction, commits it on success and
    /// rolls it back on failure. Without it the callback runs inside whatever transaction is
    /// active (possibly none) and nothing is committed or rolled back here.
    ///
    /// A blank statement does nothing and returns `T::default()`. Failures are logged with the
    /// diagnostic rendering of the statement and returned unchanged.
    pub async fn execute<T, F>(
        &mut self,
        starts_new_transaction: bool,
        sql: &str,
        params: &ParameterSet,
        callback: F,
    ) -> DbResult<T>
    where
        T: Default,
        F: AsyncFnOnce(&mut DbConnection, Option<&TransactionHandle>) -> DbResult<T>,
    {
        if sql.trim().is_empty() {
            return Ok(T::default());
        }

        let diagnostic = build_final_query(sql, params);
        match self
            .run_in_scope(starts_new_transaction, &diagnostic, callback)
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => {
                if starts_new_transaction {
                    if let Err(rollback_err) = self.rollback().await {
                        error!(
                            error = %rollback_err,
                            "Rollback after failed statement also failed"
                        );
                    }
                }
                error!(
                    connection = %self.context.masked_connection_string(),
                    sql = %diagnostic,
                    error = %e,
                    "Statement execution failed"
                );
                Err(e)
            }
        }
    }

    async fn run_in_scope<T, F>(
        &mut self,
        starts_new_transaction: bool,
        diagnostic: &str,
        callback: F,
    ) -> DbResult<T>
    where
        F: AsyncFnOnce(&mut DbConnection, Option<&TransactionHandle>) -> DbResult<T>,
    {
        if starts_new_transaction {
            self.begin_transaction().await?;
        }

        let timeout = self.context.effective_timeout();
        let slot = self.provider.as_mut().ok_or_else(disposed_error)?;
        let provider = slot.get();

        // Reopening would run the rest of the unit of work outside its transaction
        let lost = self
            .state
            .handle()
            .filter(|_| provider.state() != ConnectionState::Open)
            .map(|handle| handle.id.clone());
        if let Some(transaction_id) = lost {
            self.state = TransactionState::NoTransaction;
            error!(
                transaction_id = %transaction_id,
                connection = %self.context.masked_connection_string(),
                "Transaction lost with its connection"
            );
            return Err(DbError::connection(
                format!(
                    "Transaction {} was lost with its connection; its work was not committed",
                    transaction_id
                ),
                "Begin a new transaction and retry the whole unit of work",
            ));
        }

        provider.open().await?;

        let session = provider.session();
        trace!(
            connection = %self.context.masked_connection_string(),
            isolation_level = %self.context.isolation_level(),
            server_process_id = ?session.and_then(|s| s.server_process_id),
            client_connection_id = ?session.map(|s| s.client_connection_id),
            sql = %diagnostic,
            "Executing statement"
        );

        let transaction = self.state.handle();
        let outcome = {
            let conn = provider.connection()?;
            let call = callback(conn, transaction);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(DbError::timeout("statement execution", limit.as_secs())),
                },
                None => call.await,
            }
        };

        if let Err(e) = &outcome {
            provider.note_failure(e);
        }
        provider.drain_server_messages().await;
        let value = outcome?;

        if starts_new_transaction {
            self.commit().await?;
        }
        Ok(value)
    }

    /// Roll back whatever is still active, then dispose the provider if owned.
    ///
    /// The provider is disposed even when the rollback fails; the first error is returned.
    pub async fn dispose(mut self) -> DbResult<()> {
        let rollback_result = self.rollback().await;
        let dispose_result = match self.provider.take() {
            Some(ProviderSlot::Owned(provider)) => provider.dispose().await.map(|_| ()),
            _ => Ok(()),
        };
        trace!(connection = %self.context.masked_connection_string(), "Transaction manager disposed");
        rollback_result.and(dispose_result)
    }
}

/// Roll back what a failed `COMMIT` may have left open.
///
/// A server-side rollback error means the server already ended the transaction. If the
/// connection itself failed it is marked broken, which discards the transaction on recycle.
async fn release_failed_commit(
    provider: &mut ConnectionProvider,
    transaction_id: &str,
    cause: &DbError,
) {
    if cause.breaks_connection() {
        provider.mark_broken();
        return;
    }
    let result = match provider.connection() {
        Ok(conn) => conn.rollback().await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => warn!(transaction_id, "Rolled back after failed commit"),
        Err(e) if !e.breaks_connection() => {
            debug!(transaction_id, error = %e, "Server already ended the failed transaction")
        }
        Err(e) => {
            error!(transaction_id, error = %e, "Rollback after failed commit failed");
            provider.mark_broken();
        }
    }
}

impl Drop for TransactionManager<'_> {
    fn drop(&mut self) {
        if let TransactionState::Active(handle) = &self.state {
            // No async rollback here; the provider runs it before the connection is reused
            warn!(
                transaction_id = %handle.id,
                "Transaction manager dropped with an active transaction"
            );
            if let Some(slot) = self.provider.as_mut() {
                slot.get().abandon_transaction();
            }
        }
    }
}
