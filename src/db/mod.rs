//! Database abstraction layer.
//!
//! This module provides the transactional execution functionality:
//! - Physical connections and native transaction statements
//! - Connection providers (owned or borrowed connections)
//! - The transaction manager state machine
//! - Statement execution for the common result shapes
//! - Placeholder rewriting, parameter binding and type mappings
//! - Diagnostic rendering of statements for trace output

pub mod connection;
pub mod diagnostic;
pub mod executor;
pub mod params;
pub mod provider;
pub mod transaction;
pub mod types;

pub use connection::DbConnection;
pub use diagnostic::build_final_query;
pub use executor::SqlExecution;
pub use provider::ConnectionProvider;
pub use transaction::{TransactionHandle, TransactionManager, TransactionState};
pub use types::{JsonRow, RowToJson};
