//! db-txn-executor library
//!
//! A transactional execution layer for SQL statements over SQLite, PostgreSQL and MySQL:
//! explicit transaction boundaries, owned or borrowed connections, per-call timeouts and a
//! diagnostic rendering of each statement for trace logs.

pub mod blocking;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use blocking::BlockingRuntime;
pub use config::Config;
pub use db::{ConnectionProvider, SqlExecution, TransactionManager};
pub use error::{DbError, DbResult};
