//! Statement executor.
//!
//! [`SqlExecution`] is the thin collaborator on top of [`TransactionManager::execute`]: it
//! turns a [`StatementInvocation`] into driver calls for the usual result shapes (rows
//! affected, rows, first row, scalar, multiple result sets, streamed rows).
//!
//! An execution built with [`SqlExecution::new`] owns a fresh manager and disposes it after
//! the call. One built with [`SqlExecution::with_manager`] runs inside the caller's manager and
//! leaves its transaction alone unless told otherwise.

use crate::db::connection::DbConnection;
use crate::db::params::procedure_call_text;
use crate::db::transaction::TransactionManager;
use crate::db::types::JsonRow;
use crate::error::{DbError, DbResult};
use crate::models::{CommandKind, ExecutionContext, ParameterSet, StatementInvocation};
use serde_json::Value as JsonValue;
use tracing::error;

enum ManagerSlot<'m, 'p> {
    Owned(TransactionManager<'p>),
    Shared(&'m mut TransactionManager<'p>),
}

impl<'p> ManagerSlot<'_, 'p> {
    fn get(&mut self) -> &mut TransactionManager<'p> {
        match self {
            ManagerSlot::Owned(manager) => manager,
            ManagerSlot::Shared(manager) => manager,
        }
    }

    /// Dispose an owned manager. The statement's own error wins over a dispose error.
    async fn finish<T>(self, result: DbResult<T>) -> DbResult<T> {
        let ManagerSlot::Owned(manager) = self else {
            return result;
        };
        match (result, manager.dispose().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(dispose_err)) => {
                error!(error = %dispose_err, "Failed to dispose transaction manager");
                Err(e)
            }
        }
    }
}

/// One statement invocation bound to a transaction manager.
pub struct SqlExecution<'m, 'p> {
    manager: ManagerSlot<'m, 'p>,
    invocation: StatementInvocation,
    owns_transaction: bool,
}

impl SqlExecution<'static, 'static> {
    /// Execution with its own manager.
    ///
    /// The call runs in its own transaction when the context starts transactions, unless the
    /// invocation overrides it.
    pub fn new(context: ExecutionContext, invocation: StatementInvocation) -> Self {
        let owns_transaction = invocation.owns_transaction_or(context.starts_transaction());
        Self {
            manager: ManagerSlot::Owned(TransactionManager::create_owned(context)),
            invocation,
            owns_transaction,
        }
    }
}

impl<'m, 'p> SqlExecution<'m, 'p> {
    /// Execution inside a caller-managed transaction manager.
    ///
    /// The call joins whatever transaction is active unless the invocation asks to own one.
    pub fn with_manager(
        manager: &'m mut TransactionManager<'p>,
        invocation: StatementInvocation,
    ) -> Self {
        let owns_transaction = invocation.owns_transaction_or(false);
        Self {
            manager: ManagerSlot::Shared(manager),
            invocation,
            owns_transaction,
        }
    }

    /// Whether this call begins and ends its own transaction.
    pub fn owns_transaction(&self) -> bool {
        self.owns_transaction
    }

    async fn run<T, F>(self, op: F) -> DbResult<T>
    where
        T: Default,
        F: AsyncFnOnce(&mut DbConnection, &str, &ParameterSet) -> DbResult<T>,
    {
        let SqlExecution {
            mut manager,
            invocation,
            owns_transaction,
        } = self;

        let result = match command_text(&invocation, manager.get().context()) {
            Ok(sql) => {
                let sql_ref = sql.as_str();
                let params = invocation.parameters();
                manager
                    .get()
                    .execute(owns_transaction, sql_ref, params, async move |conn, _tx| {
                        op(conn, sql_ref, params).await
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        manager.finish(result).await
    }

    /// Run the statement and return the number of affected rows.
    pub async fn execute(self) -> DbResult<u64> {
        self.run(async |conn, sql, params| conn.execute_statement(sql, params).await)
            .await
    }

    /// Run the statement and return every row.
    pub async fn query(self) -> DbResult<Vec<JsonRow>> {
        self.run(async |conn, sql, params| conn.fetch_rows(sql, params).await)
            .await
    }

    /// Run the statement and return the first row, if any.
    pub async fn first_or_default(self) -> DbResult<Option<JsonRow>> {
        self.run(async |conn, sql, params| conn.fetch_first(sql, params).await)
            .await
    }

    /// First column of the first row, or `Null` when there are no rows.
    pub async fn execute_scalar(self) -> DbResult<JsonValue> {
        self.run(async |conn, sql, params| conn.fetch_scalar(sql, params).await)
            .await
    }

    /// One row list per statement in the batch.
    pub async fn query_multiple(self) -> DbResult<Vec<Vec<JsonRow>>> {
        self.run(async |conn, sql, params| conn.fetch_result_sets(sql, params).await)
            .await
    }

    /// Hand each row to `on_row` as it is read; returns the row count.
    pub async fn read_rows<F>(self, on_row: F) -> DbResult<u64>
    where
        F: FnMut(JsonRow) -> DbResult<()>,
    {
        self.run(async move |conn, sql, params| conn.stream_rows(sql, params, on_row).await)
            .await
    }
}

/// SQL text to send for an invocation. A blank invocation yields blank text.
fn command_text(invocation: &StatementInvocation, context: &ExecutionContext) -> DbResult<String> {
    let text = invocation.command_text();
    if text.trim().is_empty() {
        return Ok(String::new());
    }
    match invocation.kind() {
        CommandKind::Text => Ok(text.to_string()),
        CommandKind::StoredProcedure => {
            let db_type = context.db_type().ok_or_else(|| {
                DbError::configuration("Cannot determine the database type of the connection")
            })?;
            procedure_call_text(text, invocation.parameters(), db_type)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_text_for_procedures() {
        let params = ParameterSet::new().with("id", 1);
        let inv = StatementInvocation::procedure("refresh_totals", params);

        let mysql = ExecutionContext::new("mysql://u:p@localhost/app");
        assert_eq!(
            command_text(&inv, &mysql).unwrap(),
            "CALL refresh_totals(@id)"
        );

        let sqlite = ExecutionContext::new("sqlite::memory:");
        assert!(matches!(
            command_text(&inv, &sqlite),
            Err(DbError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_command_text_blank_and_text() {
        let ctx = ExecutionContext::new("sqlite::memory:");
        let blank = StatementInvocation::procedure("  ", ParameterSet::new());
        assert_eq!(command_text(&blank, &ctx).unwrap(), "");

        let text = StatementInvocation::text("SELECT 1", ParameterSet::new());
        assert_eq!(command_text(&text, &ctx).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_owns_transaction_defaults() {
        let ctx = ExecutionContext::new("sqlite::memory:");
        let owned = SqlExecution::new(
            ctx.clone(),
            StatementInvocation::text("SELECT 1", ParameterSet::new()),
        );
        assert!(owned.owns_transaction());

        let no_tx = SqlExecution::new(
            ctx.clone().with_starts_transaction(false),
            StatementInvocation::text("SELECT 1", ParameterSet::new()),
        );
        assert!(!no_tx.owns_transaction());

        let mut manager = TransactionManager::create_owned(ctx);
        let shared = SqlExecution::with_manager(
            &mut manager,
            StatementInvocation::text("SELECT 1", ParameterSet::new()),
        );
        assert!(!shared.owns_transaction());
    }

    #[tokio::test]
    async fn test_scalar_with_parameter() {
        let ctx = ExecutionContext::new("sqlite::memory:");
        let params = ParameterSet::new().with("Id", 123456);
        let value = SqlExecution::new(ctx, StatementInvocation::text("Select @Id as Id", params))
            .execute_scalar()
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!(123456));
    }
}
