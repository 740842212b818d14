//! Blocking variants of the transaction and execution operations.
//!
//! [`BlockingRuntime`] owns a current-thread tokio runtime and drives the async operations to
//! completion on the calling thread. It refuses to run inside an existing async runtime, where
//! blocking would stall the executor.

use crate::db::{JsonRow, SqlExecution, TransactionHandle, TransactionManager};
use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};

/// Runtime for synchronous callers.
pub struct BlockingRuntime {
    runtime: Runtime,
}

impl std::fmt::Debug for BlockingRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingRuntime").finish_non_exhaustive()
    }
}

fn ensure_outside_runtime() -> DbResult<()> {
    if Handle::try_current().is_ok() {
        return Err(DbError::internal(
            "Blocking operations cannot be used from within an async runtime",
        ));
    }
    Ok(())
}

impl BlockingRuntime {
    pub fn new() -> DbResult<Self> {
        ensure_outside_runtime()?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::internal(format!("Failed to build runtime: {e}")))?;
        Ok(Self { runtime })
    }

    /// Drive any future to completion.
    pub fn block_on<F: Future>(&self, future: F) -> DbResult<F::Output> {
        ensure_outside_runtime()?;
        Ok(self.runtime.block_on(future))
    }

    fn run<T, F>(&self, future: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        self.block_on(future)?
    }

    pub fn begin_transaction(
        &self,
        manager: &mut TransactionManager<'_>,
    ) -> DbResult<TransactionHandle> {
        self.run(async { manager.begin_transaction().await.cloned() })
    }

    pub fn commit(&self, manager: &mut TransactionManager<'_>) -> DbResult<()> {
        self.run(manager.commit())
    }

    pub fn rollback(&self, manager: &mut TransactionManager<'_>) -> DbResult<()> {
        self.run(manager.rollback())
    }

    pub fn dispose(&self, manager: TransactionManager<'_>) -> DbResult<()> {
        self.run(manager.dispose())
    }

    pub fn execute(&self, execution: SqlExecution<'_, '_>) -> DbResult<u64> {
        self.run(execution.execute())
    }

    pub fn query(&self, execution: SqlExecution<'_, '_>) -> DbResult<Vec<JsonRow>> {
        self.run(execution.query())
    }

    pub fn first_or_default(
        &self,
        execution: SqlExecution<'_, '_>,
    ) -> DbResult<Option<JsonRow>> {
        self.run(execution.first_or_default())
    }

    pub fn execute_scalar(&self, execution: SqlExecution<'_, '_>) -> DbResult<JsonValue> {
        self.run(execution.execute_scalar())
    }

    pub fn query_multiple(&self, execution: SqlExecution<'_, '_>) -> DbResult<Vec<Vec<JsonRow>>> {
        self.run(execution.query_multiple())
    }

    pub fn read_rows<F>(&self, execution: SqlExecution<'_, '_>, on_row: F) -> DbResult<u64>
    where
        F: FnMut(JsonRow) -> DbResult<()>,
    {
        self.run(execution.read_rows(on_row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionContext, ParameterSet, StatementInvocation};

    fn memory_context() -> ExecutionContext {
        ExecutionContext::new("sqlite::memory:")
    }

    #[test]
    fn test_scalar_blocking() {
        let rt = BlockingRuntime::new().unwrap();
        let params = ParameterSet::new().with("Id", 123456);
        let value = rt
            .execute_scalar(SqlExecution::new(
                memory_context(),
                StatementInvocation::text("Select @Id as Id", params),
            ))
            .unwrap();
        assert_eq!(value, serde_json::json!(123456));
    }

    #[test]
    fn test_manager_round_trip_blocking() {
        let rt = BlockingRuntime::new().unwrap();
        let mut manager = TransactionManager::create_owned(memory_context());

        let handle = rt.begin_transaction(&mut manager).unwrap();
        assert!(handle.id().starts_with("tx_"));
        assert!(manager.is_active());

        let create = StatementInvocation::text(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)",
            ParameterSet::new(),
        );
        rt.execute(SqlExecution::with_manager(&mut manager, create))
            .unwrap();

        let insert = StatementInvocation::text(
            "INSERT INTO items (name) VALUES (@name)",
            ParameterSet::new().with("name", "widget"),
        );
        assert_eq!(
            rt.execute(SqlExecution::with_manager(&mut manager, insert))
                .unwrap(),
            1
        );

        let mut names = Vec::new();
        let count = rt
            .read_rows(
                SqlExecution::with_manager(
                    &mut manager,
                    StatementInvocation::text("SELECT name FROM items", ParameterSet::new()),
                ),
                |row| {
                    names.push(row["name"].clone());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(names, vec![serde_json::json!("widget")]);

        rt.commit(&mut manager).unwrap();
        assert!(!manager.is_active());
        rt.dispose(manager).unwrap();
    }

    #[test]
    fn test_rejects_nested_runtime() {
        let outer = Builder::new_current_thread().build().unwrap();
        let result = outer.block_on(async { BlockingRuntime::new() });
        assert!(matches!(result, Err(DbError::Internal { .. })));
    }
}
