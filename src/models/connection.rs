//! Connection-related data models.
//!
//! This module defines the backend type, the physical connection state and the
//! session identifiers reported in trace output.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.trim().to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Whether the backend can run `CALL procedure(...)`.
    pub fn supports_stored_procedures(&self) -> bool {
        !matches!(self, Self::SQLite)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// State of the physical connection held by a connection provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Open,
    /// The connection failed mid-operation and must be recycled before reuse.
    Broken,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::Broken => write!(f, "broken"),
        }
    }
}

/// Identifiers of the current physical session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Generated on every physical open.
    pub client_connection_id: Uuid,
    /// `CONNECTION_ID()` on MySQL, `pg_backend_pid()` on PostgreSQL.
    pub server_process_id: Option<i64>,
}

impl SessionInfo {
    pub fn new(server_process_id: Option<i64>) -> Self {
        Self {
            client_connection_id: Uuid::new_v4(),
            server_process_id,
        }
    }
}

/// Severity of a message reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMessageLevel {
    Note,
    Warning,
    Error,
}

impl ServerMessageLevel {
    /// Parse the `Level` column of MySQL's `SHOW WARNINGS`.
    pub fn parse(level: &str) -> Self {
        if level.eq_ignore_ascii_case("error") {
            Self::Error
        } else if level.eq_ignore_ascii_case("warning") {
            Self::Warning
        } else {
            Self::Note
        }
    }
}

/// Informational or error message emitted by the server alongside a statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    pub level: ServerMessageLevel,
    pub code: Option<u32>,
    pub message: String,
    pub procedure: Option<String>,
    pub line_number: Option<u32>,
    pub server: Option<String>,
}
