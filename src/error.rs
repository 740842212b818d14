//! Error types for the transactional execution layer.
//!
//! All failures are expressed through [`DbError`], built with `thiserror`. Variants keep enough
//! context (transaction id, SQL state, suggestion) for the caller to decide whether the
//! transaction manager is still usable.

use sqlx::error::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Commit failed: {message} (transaction: {transaction_id})")]
    Commit {
        transaction_id: String,
        message: String,
    },

    #[error("Rollback failed: {message} (transaction: {transaction_id})")]
    Rollback {
        transaction_id: String,
        message: String,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// A failure reaching the server, or a connection lost mid-call.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// A statement rejected by the server; `sql_state` is the backend's error code.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a commit failure for the given transaction.
    pub fn commit(transaction_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Commit {
            transaction_id: transaction_id.into(),
            message: message.into(),
        }
    }

    pub fn rollback(transaction_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rollback {
            transaction_id: transaction_id.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Hint for the operator, shown alongside the message by the CLI.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Whether repeating the whole unit of work on a fresh transaction may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Database {
                sql_state: Some(code),
                ..
            } => CONFLICT_CODES.contains(&code.as_str()),
            _ => false,
        }
    }

    /// Whether the physical connection must be considered broken after this error.
    ///
    /// A timed-out statement may still be in flight on the wire, so it counts as well.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Whether this error was raised while ending a transaction.
    pub fn is_transaction_end_failure(&self) -> bool {
        matches!(self, Self::Commit { .. } | Self::Rollback { .. })
    }
}

/// PostgreSQL serialization failure / deadlock, MySQL deadlock / lock wait timeout.
const CONFLICT_CODES: &[&str] = &["40001", "40P01", "1213", "1205"];

/// Suggestion for a server-reported error, from its constraint kind or SQL state.
fn database_suggestion(kind: ErrorKind, code: Option<&str>) -> &'static str {
    match kind {
        ErrorKind::UniqueViolation => "A row with the same key already exists",
        ErrorKind::ForeignKeyViolation => "A referenced row is missing or still referenced",
        ErrorKind::NotNullViolation => "Provide a value for every NOT NULL column",
        ErrorKind::CheckViolation => "A value violates a CHECK constraint",
        _ => match code {
            Some(code) if CONFLICT_CODES.contains(&code) => {
                "The transaction lost a concurrency conflict; retry the whole unit of work"
            }
            // SQLite busy / locked
            Some("5" | "6") => "Another connection holds a lock on the database; retry later",
            _ => "Check the SQL syntax and referenced objects",
        },
    }
}

/// Map driver failures onto the execution error taxonomy.
///
/// Anything that leaves the wire in an unknown state becomes [`DbError::Connection`] so the
/// provider recycles the connection.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                DbError::configuration(format!("Invalid connection target: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let suggestion = database_suggestion(db_err.kind(), code.as_deref());
                DbError::database(db_err.message(), code, suggestion)
            }
            sqlx::Error::RowNotFound => DbError::database(
                "Statement returned no rows",
                None,
                "Use first_or_default when an empty result is acceptable",
            ),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::PoolClosed => DbError::connection(
                format!("Connection lost: {}", err),
                "The connection will be reopened on the next call",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection acquire", 0),
            sqlx::Error::TypeNotFound { .. } | sqlx::Error::ColumnNotFound(_) => {
                DbError::database(err.to_string(), None, "Check the parameter and column names")
            }
            sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_) => DbError::internal(format!("Row decoding failed: {}", err)),
            other => DbError::internal(format!("Unexpected driver error: {}", other)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_only_on_server_facing_errors() {
        let err = DbError::database("no such table: orders", Some("1".to_string()), "Create it");
        assert_eq!(err.suggestion(), Some("Create it"));
        assert!(err.to_string().starts_with("Database error"));
        assert_eq!(DbError::configuration("missing").suggestion(), None);
    }

    #[test]
    fn test_conflicts_are_retryable() {
        assert!(DbError::timeout("statement execution", 30).is_retryable());
        assert!(DbError::connection("reset", "reconnect").is_retryable());
        assert!(DbError::database("deadlock", Some("40P01".to_string()), "retry").is_retryable());
        assert!(!DbError::database("syntax", Some("42601".to_string()), "fix").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_breaks_connection() {
        assert!(DbError::connection("reset by peer", "reconnect").breaks_connection());
        assert!(DbError::timeout("statement execution", 5).breaks_connection());
        assert!(!DbError::database("syntax", None, "fix it").breaks_connection());
        assert!(!DbError::commit("tx_1", "busy").breaks_connection());
    }

    #[test]
    fn test_commit_and_rollback_carry_transaction_id() {
        let err = DbError::commit("tx_abc", "deadlock");
        assert!(err.to_string().contains("tx_abc"));
        assert!(err.is_transaction_end_failure());

        let err = DbError::rollback("tx_def", "connection lost");
        assert!(err.to_string().contains("Rollback failed"));
        assert!(err.is_transaction_end_failure());
    }

    #[test]
    fn test_sqlx_configuration_maps_to_configuration() {
        let err: DbError = sqlx::Error::Configuration("bad url".into()).into();
        assert!(matches!(err, DbError::Configuration { .. }));
    }

    #[test]
    fn test_sqlx_io_maps_to_connection() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: DbError = sqlx::Error::Io(io).into();
        assert!(matches!(err, DbError::Connection { .. }));
        assert!(err.breaks_connection());
    }

    #[test]
    fn test_sqlx_row_not_found_maps_to_database() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::Database { .. }));
    }

    #[test]
    fn test_database_suggestion_by_kind_and_code() {
        assert!(database_suggestion(ErrorKind::UniqueViolation, None).contains("same key"));
        assert!(database_suggestion(ErrorKind::Other, Some("40001")).contains("retry"));
        assert!(database_suggestion(ErrorKind::Other, Some("1213")).contains("retry"));
        assert!(database_suggestion(ErrorKind::Other, Some("5")).contains("lock"));
        assert_eq!(
            database_suggestion(ErrorKind::Other, Some("42601")),
            "Check the SQL syntax and referenced objects"
        );
    }
}
