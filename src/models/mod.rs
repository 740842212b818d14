//! Data models for the transactional execution layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod context;
pub mod params;
pub mod statement;

// Re-export commonly used types
pub use connection::{
    ConnectionState, DatabaseType, ServerMessage, ServerMessageLevel, SessionInfo,
};
pub use context::{
    DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_LONG_RUNNING_TIMEOUT_SECS, ExecutionContext,
    ExecutionContextFactory, IsolationLevel, TimeoutProfile, mask_connection_string,
};
pub use params::{CommandKind, ParameterSet, SqlParam, SqlValue};
pub use statement::StatementInvocation;
