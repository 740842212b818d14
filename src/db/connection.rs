//! Physical database connections.
//!
//! A [`DbConnection`] wraps exactly one backend connection (no pool). Transactions are driven
//! with native `BEGIN`/`COMMIT`/`ROLLBACK` statements so that a transaction can span any number
//! of calls on the same connection.
//!
//! Statement helpers accept `@name` placeholders and a [`ParameterSet`]; see
//! [`crate::db::params`] for the rewriting rules.

use crate::db::params::{
    NativeStatement, bind_mysql_value, bind_postgres_value, bind_sqlite_value,
    rewrite_placeholders,
};
use crate::db::types::{JsonRow, RowToJson};
use crate::error::{DbError, DbResult};
use crate::models::{
    DatabaseType, IsolationLevel, ParameterSet, ServerMessage, ServerMessageLevel,
};
use futures_util::TryStreamExt;
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, Either, Executor, Row};
use std::str::FromStr;
use tracing::debug;

/// A single database-specific connection.
#[derive(Debug)]
pub enum DbConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

/// Native statements that start a transaction at the given isolation level.
pub fn begin_statements(db: DatabaseType, level: IsolationLevel) -> Vec<String> {
    match db {
        DatabaseType::PostgreSQL => {
            let level = match level {
                IsolationLevel::Snapshot => IsolationLevel::RepeatableRead,
                other => other,
            };
            vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]
        }
        DatabaseType::MySQL => match level {
            IsolationLevel::Snapshot => vec![
                "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ".to_string(),
                "START TRANSACTION WITH CONSISTENT SNAPSHOT".to_string(),
            ],
            other => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", other.as_sql()),
                "START TRANSACTION".to_string(),
            ],
        },
        // SQLite transactions are always serializable; IMMEDIATE takes the write lock up front
        DatabaseType::SQLite => match level {
            IsolationLevel::Serializable => vec!["BEGIN IMMEDIATE".to_string()],
            _ => vec!["BEGIN DEFERRED".to_string()],
        },
    }
}

impl DbConnection {
    /// Open a new physical connection to `url`.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let db_type = DatabaseType::from_connection_string(url).ok_or_else(|| {
            DbError::configuration(
                "Unsupported database URL scheme. Use postgres://, mysql:// or sqlite:",
            )
        })?;

        let conn = match db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(url)?.charset("utf8mb4");
                DbConnection::MySql(options.connect().await?)
            }
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(url)?;
                DbConnection::Postgres(options.connect().await?)
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
                DbConnection::SQLite(options.connect().await?)
            }
        };
        Ok(conn)
    }

    /// Get the database type for this connection.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbConnection::MySql(_) => DatabaseType::MySQL,
            DbConnection::Postgres(_) => DatabaseType::PostgreSQL,
            DbConnection::SQLite(_) => DatabaseType::SQLite,
        }
    }

    /// Close the connection gracefully.
    pub async fn close(self) -> DbResult<()> {
        match self {
            DbConnection::MySql(c) => c.close().await?,
            DbConnection::Postgres(c) => c.close().await?,
            DbConnection::SQLite(c) => c.close().await?,
        }
        Ok(())
    }

    /// Check that the server still answers.
    pub async fn ping(&mut self) -> DbResult<()> {
        match self {
            DbConnection::MySql(c) => c.ping().await?,
            DbConnection::Postgres(c) => c.ping().await?,
            DbConnection::SQLite(c) => c.ping().await?,
        }
        Ok(())
    }

    /// Server-side session id: `CONNECTION_ID()` on MySQL, `pg_backend_pid()` on PostgreSQL.
    pub async fn server_process_id(&mut self) -> DbResult<Option<i64>> {
        match self {
            DbConnection::MySql(c) => {
                let id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
                    .fetch_one(&mut *c)
                    .await?;
                Ok(i64::try_from(id).ok())
            }
            DbConnection::Postgres(c) => {
                let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
                    .fetch_one(&mut *c)
                    .await?;
                Ok(Some(i64::from(pid)))
            }
            DbConnection::SQLite(_) => Ok(None),
        }
    }

    async fn execute_raw(&mut self, sql: &str) -> DbResult<()> {
        debug!(sql = %sql, "Executing transaction control statement");
        match self {
            DbConnection::MySql(c) => c.execute(sql).await.map(|_| ())?,
            DbConnection::Postgres(c) => c.execute(sql).await.map(|_| ())?,
            DbConnection::SQLite(c) => c.execute(sql).await.map(|_| ())?,
        }
        Ok(())
    }

    /// Start a native transaction at `level`.
    pub async fn begin(&mut self, level: IsolationLevel) -> DbResult<()> {
        for statement in begin_statements(self.db_type(), level) {
            self.execute_raw(&statement).await?;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.execute_raw("COMMIT").await
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.execute_raw("ROLLBACK").await
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute_statement(&mut self, sql: &str, params: &ParameterSet) -> DbResult<u64> {
        match self {
            DbConnection::MySql(c) => mysql::execute(c, sql, params).await,
            DbConnection::Postgres(c) => postgres::execute(c, sql, params).await,
            DbConnection::SQLite(c) => sqlite::execute(c, sql, params).await,
        }
    }

    /// Run a query and decode every row.
    pub async fn fetch_rows(&mut self, sql: &str, params: &ParameterSet) -> DbResult<Vec<JsonRow>> {
        match self {
            DbConnection::MySql(c) => mysql::fetch_rows(c, sql, params).await,
            DbConnection::Postgres(c) => postgres::fetch_rows(c, sql, params).await,
            DbConnection::SQLite(c) => sqlite::fetch_rows(c, sql, params).await,
        }
    }

    /// Run a query and decode the first row, if any.
    pub async fn fetch_first(
        &mut self,
        sql: &str,
        params: &ParameterSet,
    ) -> DbResult<Option<JsonRow>> {
        self.fetch_first_with(sql, params, |row| row.to_json_map())
            .await
    }

    /// Run a query and return the first column of the first row, or `Null`.
    pub async fn fetch_scalar(&mut self, sql: &str, params: &ParameterSet) -> DbResult<JsonValue> {
        Ok(self
            .fetch_first_with(sql, params, |row| row.first_value())
            .await?
            .unwrap_or(JsonValue::Null))
    }

    async fn fetch_first_with<T>(
        &mut self,
        sql: &str,
        params: &ParameterSet,
        decode: fn(&dyn RowToJson) -> T,
    ) -> DbResult<Option<T>> {
        match self {
            DbConnection::MySql(c) => Ok(mysql::fetch_first(c, sql, params)
                .await?
                .map(|row| decode(&row))),
            DbConnection::Postgres(c) => Ok(postgres::fetch_first(c, sql, params)
                .await?
                .map(|row| decode(&row))),
            DbConnection::SQLite(c) => Ok(sqlite::fetch_first(c, sql, params)
                .await?
                .map(|row| decode(&row))),
        }
    }

    /// Run a batch and collect one row list per statement.
    pub async fn fetch_result_sets(
        &mut self,
        sql: &str,
        params: &ParameterSet,
    ) -> DbResult<Vec<Vec<JsonRow>>> {
        match self {
            DbConnection::MySql(c) => mysql::fetch_result_sets(c, sql, params).await,
            DbConnection::Postgres(c) => postgres::fetch_result_sets(c, sql, params).await,
            DbConnection::SQLite(c) => sqlite::fetch_result_sets(c, sql, params).await,
        }
    }

    /// Stream rows to `on_row` one at a time and return how many were read.
    pub async fn stream_rows<F>(
        &mut self,
        sql: &str,
        params: &ParameterSet,
        on_row: F,
    ) -> DbResult<u64>
    where
        F: FnMut(JsonRow) -> DbResult<()>,
    {
        match self {
            DbConnection::MySql(c) => mysql::stream_rows(c, sql, params, on_row).await,
            DbConnection::Postgres(c) => postgres::stream_rows(c, sql, params, on_row).await,
            DbConnection::SQLite(c) => sqlite::stream_rows(c, sql, params, on_row).await,
        }
    }

    /// Drain the diagnostics left by the last statement.
    ///
    /// Only MySQL keeps them queryable (`SHOW WARNINGS`); the other backends return nothing.
    pub async fn take_server_messages(&mut self) -> DbResult<Vec<ServerMessage>> {
        let DbConnection::MySql(c) = self else {
            return Ok(Vec::new());
        };

        // Raw execution: preparing SHOW WARNINGS would reset the list it reports
        let rows = c.fetch_all("SHOW WARNINGS").await?;
        let messages = rows
            .iter()
            .map(|row| ServerMessage {
                level: ServerMessageLevel::parse(
                    &row.try_get::<String, _>(0).unwrap_or_default(),
                ),
                code: row.try_get::<u32, _>(1).ok(),
                message: row.try_get::<String, _>(2).unwrap_or_default(),
                procedure: None,
                line_number: None,
                server: None,
            })
            .collect();
        Ok(messages)
    }
}

/// Build a query from a rewritten statement with every value bound.
macro_rules! bound_query {
    ($native:expr, $binder:path) => {{
        let mut query = sqlx::query($native.sql.as_str());
        for value in $native.bindings.iter().copied() {
            query = $binder(query, value);
        }
        query
    }};
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module provides the same interface adapted to its connection type. Statements
// without bound values run as raw SQL, which avoids prepared statement issues
// (some SQL like CREATE PROCEDURE doesn't support prepared statements).

macro_rules! backend_ops {
    ($module:ident, $db:expr, $conn:ty, $row:ty, $binder:path) => {
        mod $module {
            use super::*;

            fn native<'a>(
                sql: &str,
                params: &'a ParameterSet,
            ) -> DbResult<NativeStatement<'a>> {
                rewrite_placeholders(sql, params, $db)
            }

            pub async fn execute(
                conn: &mut $conn,
                sql: &str,
                params: &ParameterSet,
            ) -> DbResult<u64> {
                let native = native(sql, params)?;
                let result = if native.bindings.is_empty() {
                    conn.execute(native.sql.as_str()).await?
                } else {
                    conn.execute(bound_query!(native, $binder)).await?
                };
                Ok(result.rows_affected())
            }

            pub async fn fetch_rows(
                conn: &mut $conn,
                sql: &str,
                params: &ParameterSet,
            ) -> DbResult<Vec<JsonRow>> {
                let native = native(sql, params)?;
                let rows = if native.bindings.is_empty() {
                    conn.fetch_all(native.sql.as_str()).await?
                } else {
                    conn.fetch_all(bound_query!(native, $binder)).await?
                };
                Ok(rows.iter().map(|r| r.to_json_map()).collect())
            }

            pub async fn fetch_first(
                conn: &mut $conn,
                sql: &str,
                params: &ParameterSet,
            ) -> DbResult<Option<$row>> {
                let native = native(sql, params)?;
                let row = if native.bindings.is_empty() {
                    conn.fetch_optional(native.sql.as_str()).await?
                } else {
                    conn.fetch_optional(bound_query!(native, $binder)).await?
                };
                Ok(row)
            }

            pub async fn fetch_result_sets(
                conn: &mut $conn,
                sql: &str,
                params: &ParameterSet,
            ) -> DbResult<Vec<Vec<JsonRow>>> {
                let native = native(sql, params)?;
                let mut stream = if native.bindings.is_empty() {
                    conn.fetch_many(native.sql.as_str())
                } else {
                    conn.fetch_many(bound_query!(native, $binder))
                };

                let mut sets = Vec::new();
                let mut current = Vec::new();
                while let Some(step) = stream.try_next().await? {
                    match step {
                        // End of one statement's results
                        Either::Left(_) => sets.push(std::mem::take(&mut current)),
                        Either::Right(row) => current.push(row.to_json_map()),
                    }
                }
                if !current.is_empty() {
                    sets.push(current);
                }
                Ok(sets)
            }

            pub async fn stream_rows<F>(
                conn: &mut $conn,
                sql: &str,
                params: &ParameterSet,
                mut on_row: F,
            ) -> DbResult<u64>
            where
                F: FnMut(JsonRow) -> DbResult<()>,
            {
                let native = native(sql, params)?;
                let mut stream = if native.bindings.is_empty() {
                    conn.fetch(native.sql.as_str())
                } else {
                    conn.fetch(bound_query!(native, $binder))
                };

                let mut count = 0u64;
                while let Some(row) = stream.try_next().await? {
                    on_row(row.to_json_map())?;
                    count += 1;
                }
                Ok(count)
            }
        }
    };
}

backend_ops!(
    mysql,
    DatabaseType::MySQL,
    MySqlConnection,
    sqlx::mysql::MySqlRow,
    bind_mysql_value
);
backend_ops!(
    postgres,
    DatabaseType::PostgreSQL,
    PgConnection,
    sqlx::postgres::PgRow,
    bind_postgres_value
);
backend_ops!(
    sqlite,
    DatabaseType::SQLite,
    SqliteConnection,
    sqlx::sqlite::SqliteRow,
    bind_sqlite_value
);
