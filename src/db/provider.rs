//! Connection provider: one physical connection, owned or borrowed.
//!
//! An owned provider opens its connection lazily on first use, recycles it when it breaks and
//! closes it on dispose. A borrowed provider wraps a connection created elsewhere and never
//! closes or replaces it; [`ConnectionProvider::dispose`] hands it back instead.

use crate::db::connection::DbConnection;
use crate::error::{DbError, DbResult};
use crate::models::{
    ConnectionState, DatabaseType, ExecutionContext, IsolationLevel, ServerMessageLevel,
    SessionInfo,
};
use tracing::{debug, error, trace, warn};

pub struct ConnectionProvider {
    connection: Option<DbConnection>,
    owns_connection: bool,
    state: ConnectionState,
    /// Contains sensitive data - never log unmasked
    connection_string: String,
    masked_connection_string: String,
    server_name: Option<String>,
    log_server_messages: bool,
    session: Option<SessionInfo>,
    /// A transaction was abandoned on the live connection and must be rolled back before reuse
    rollback_pending: bool,
}

impl std::fmt::Debug for ConnectionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProvider")
            .field("connection_string", &self.masked_connection_string)
            .field("owns_connection", &self.owns_connection)
            .field("state", &self.state)
            .field("session", &self.session)
            .field("rollback_pending", &self.rollback_pending)
            .finish()
    }
}

impl ConnectionProvider {
    /// Provider that creates, owns and eventually closes its own connection.
    ///
    /// Nothing is opened until the first [`open`](Self::open).
    pub fn create_owned(context: &ExecutionContext) -> Self {
        Self {
            connection: None,
            owns_connection: true,
            state: ConnectionState::Closed,
            connection_string: context.connection_string().to_string(),
            masked_connection_string: context.masked_connection_string(),
            server_name: context.server_name(),
            log_server_messages: context.log_server_messages(),
            session: None,
            rollback_pending: false,
        }
    }

    /// Provider over a connection opened by someone else. It is never closed here.
    pub fn wrap_existing(connection: DbConnection, context: &ExecutionContext) -> Self {
        Self {
            connection: Some(connection),
            owns_connection: false,
            state: ConnectionState::Open,
            connection_string: context.connection_string().to_string(),
            masked_connection_string: context.masked_connection_string(),
            server_name: context.server_name(),
            log_server_messages: context.log_server_messages(),
            session: None,
            rollback_pending: false,
        }
    }

    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identifiers of the current session, known once the connection has been opened.
    pub fn session(&self) -> Option<&SessionInfo> {
        self.session.as_ref()
    }

    pub fn masked_connection_string(&self) -> &str {
        &self.masked_connection_string
    }

    pub fn db_type(&self) -> Option<DatabaseType> {
        self.connection
            .as_ref()
            .map(DbConnection::db_type)
            .or_else(|| DatabaseType::from_connection_string(&self.connection_string))
    }

    /// Whether an abandoned transaction still waits to be rolled back.
    pub fn has_pending_rollback(&self) -> bool {
        self.rollback_pending
    }

    /// Open the connection if needed.
    ///
    /// Idempotent while open. A transaction abandoned on the live connection is rolled back
    /// first. A broken owned connection is closed and reopened; a broken borrowed connection
    /// is reported as a connection error and left untouched.
    pub async fn open(&mut self) -> DbResult<()> {
        if let Err(e) = self.settle_abandoned_transaction().await {
            warn!(
                connection = %self.masked_connection_string,
                error = %e,
                "Rollback of abandoned transaction failed"
            );
        }

        match self.state {
            ConnectionState::Open => {
                if self.session.is_none() {
                    self.probe_session().await;
                }
                Ok(())
            }
            ConnectionState::Broken if !self.owns_connection => Err(DbError::connection(
                "Borrowed connection is broken",
                "The owner of the connection must recycle it before reuse",
            )),
            ConnectionState::Broken => {
                warn!(
                    connection = %self.masked_connection_string,
                    "Recycling broken connection"
                );
                if let Some(conn) = self.connection.take() {
                    if let Err(e) = conn.close().await {
                        debug!(error = %e, "Closing broken connection failed");
                    }
                }
                self.state = ConnectionState::Closed;
                self.session = None;
                self.rollback_pending = false;
                self.connect().await
            }
            ConnectionState::Closed if !self.owns_connection => Err(DbError::connection(
                "Borrowed connection is no longer available",
                "Wrap a live connection",
            )),
            ConnectionState::Closed => self.connect().await,
        }
    }

    async fn connect(&mut self) -> DbResult<()> {
        if self.connection_string.trim().is_empty() {
            return Err(DbError::configuration("No connection target configured"));
        }

        trace!(connection = %self.masked_connection_string, "Opening connection");
        let conn = DbConnection::connect(&self.connection_string)
            .await
            .map_err(|e| match e {
                DbError::Configuration { .. } => e,
                other => DbError::connection(
                    format!(
                        "Failed to open connection to {}: {}",
                        self.masked_connection_string, other
                    ),
                    "Check the connection string, credentials and that the server is reachable",
                ),
            })?;

        self.connection = Some(conn);
        self.state = ConnectionState::Open;
        self.probe_session().await;

        if let Some(session) = &self.session {
            trace!(
                connection = %self.masked_connection_string,
                client_connection_id = %session.client_connection_id,
                server_process_id = ?session.server_process_id,
                "Connection opened"
            );
        }
        Ok(())
    }

    async fn probe_session(&mut self) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        let server_process_id = match conn.server_process_id().await {
            Ok(id) => id,
            Err(e) => {
                debug!(error = %e, "Could not read server process id");
                None
            }
        };
        self.session = Some(SessionInfo::new(server_process_id));
    }

    /// The live connection. Fails unless the provider is open.
    pub fn connection(&mut self) -> DbResult<&mut DbConnection> {
        match (self.state, self.connection.as_mut()) {
            (ConnectionState::Open, Some(conn)) => Ok(conn),
            (state, _) => Err(DbError::connection(
                format!("Connection is {}", state),
                "Open the connection first",
            )),
        }
    }

    /// Open the connection and start a native transaction.
    ///
    /// Whether a transaction is already active is the caller's concern.
    pub async fn begin_transaction(&mut self, isolation_level: IsolationLevel) -> DbResult<()> {
        self.open().await?;
        let result = self.connection()?.begin(isolation_level).await;
        if let Err(e) = &result {
            self.note_failure(e);
        }
        result
    }

    /// Mark the connection unusable so the next open recycles it.
    pub fn mark_broken(&mut self) {
        if self.connection.is_some() && self.state == ConnectionState::Open {
            self.state = ConnectionState::Broken;
        }
    }

    /// Record that a transaction was left open on the live connection without an async
    /// rollback, e.g. by a manager dropped mid-transaction.
    ///
    /// The rollback runs on the next [`open`](Self::open) or [`dispose`](Self::dispose).
    pub fn abandon_transaction(&mut self) {
        if self.connection.is_some() && self.state == ConnectionState::Open {
            self.rollback_pending = true;
        }
    }

    /// Roll back a transaction recorded by [`abandon_transaction`](Self::abandon_transaction).
    ///
    /// A server-side error means no transaction is left to roll back. Anything that breaks
    /// the connection marks it broken and is returned.
    async fn settle_abandoned_transaction(&mut self) -> DbResult<()> {
        if !std::mem::take(&mut self.rollback_pending) || self.state != ConnectionState::Open {
            return Ok(());
        }
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };
        match conn.rollback().await {
            Ok(()) => {
                warn!(
                    connection = %self.masked_connection_string,
                    "Rolled back abandoned transaction"
                );
                Ok(())
            }
            Err(e) if !e.breaks_connection() => {
                debug!(error = %e, "No abandoned transaction left to roll back");
                Ok(())
            }
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Mark the connection broken if `err` leaves it in an unknown state.
    pub fn note_failure(&mut self, err: &DbError) {
        if err.breaks_connection() {
            self.mark_broken();
        }
    }

    /// Forward diagnostics left by the last statement to the log, if enabled.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn drain_server_messages(&mut self) {
        if !self.log_server_messages || self.state != ConnectionState::Open {
            return;
        }
        let Some(conn) = self.connection.as_mut() else {
            return;
        };

        let messages = match conn.take_server_messages().await {
            Ok(messages) => messages,
            Err(e) => {
                debug!(error = %e, "Failed to read server messages");
                return;
            }
        };

        for mut message in messages {
            message.server = self.server_name.clone();
            match message.level {
                ServerMessageLevel::Error => error!(
                    code = ?message.code,
                    procedure = ?message.procedure,
                    line_number = ?message.line_number,
                    server = ?message.server,
                    "{}",
                    message.message
                ),
                _ => debug!(
                    level = ?message.level,
                    code = ?message.code,
                    server = ?message.server,
                    "{}",
                    message.message
                ),
            }
        }
    }

    /// Close an owned connection. No-op for a borrowed one.
    pub async fn close(&mut self) -> DbResult<()> {
        if !self.owns_connection {
            return Ok(());
        }
        let was_open = self.state == ConnectionState::Open;
        self.state = ConnectionState::Closed;
        self.session = None;
        // Closing the session discards any open transaction
        self.rollback_pending = false;

        let Some(conn) = self.connection.take() else {
            return Ok(());
        };
        trace!(connection = %self.masked_connection_string, "Closing connection");
        match conn.close().await {
            Ok(()) => Ok(()),
            // Nothing left to save on a connection that already failed
            Err(e) if !was_open => {
                debug!(error = %e, "Closing broken connection failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the provider.
    ///
    /// An owned connection is closed; it is released even when closing fails. A borrowed
    /// connection is handed back after any abandoned transaction has been rolled back. When
    /// that rollback fails the connection is dropped rather than handed back mid-transaction.
    pub async fn dispose(mut self) -> DbResult<Option<DbConnection>> {
        if !self.owns_connection {
            self.settle_abandoned_transaction().await?;
            return Ok(self.connection.take());
        }
        self.close().await?;
        Ok(None)
    }
}
