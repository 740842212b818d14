//! Execution context: the per-call configuration bundle.
//!
//! An [`ExecutionContext`] names the connection target and carries the command timeout,
//! isolation level and transaction policy for one logical unit of work. It is built once
//! with the `with_*` methods and then only read.

use crate::models::DatabaseType;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Default command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Default long-running command timeout in seconds.
pub const DEFAULT_LONG_RUNNING_TIMEOUT_SECS: u64 = 3600;

/// Transaction isolation level requested when a transaction is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl IsolationLevel {
    /// ANSI name as used in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            // Only SQL Server spells this out; other servers get the closest ANSI level.
            Self::Snapshot => "SNAPSHOT",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "read-uncommitted",
            Self::ReadCommitted => "read-committed",
            Self::RepeatableRead => "repeatable-read",
            Self::Serializable => "serializable",
            Self::Snapshot => "snapshot",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    /// Accepts `read-committed`, `read_committed`, `READ COMMITTED` and `readcommitted`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let compact: String = s
            .chars()
            .filter(|c| !matches!(c, '-' | '_' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match compact.as_str() {
            "readuncommitted" => Ok(Self::ReadUncommitted),
            "readcommitted" => Ok(Self::ReadCommitted),
            "repeatableread" => Ok(Self::RepeatableRead),
            "serializable" => Ok(Self::Serializable),
            "snapshot" => Ok(Self::Snapshot),
            _ => Err(format!(
                "Unknown isolation level '{}'. Expected one of: read-uncommitted, read-committed, repeatable-read, serializable, snapshot",
                s
            )),
        }
    }
}

/// Configuration for one logical database call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Contains sensitive data - never log unmasked
    connection_string: String,
    command_timeout: Duration,
    isolation_level: IsolationLevel,
    starts_transaction: bool,
    log_server_messages: bool,
}

impl ExecutionContext {
    /// Create a context with the defaults: 30 second timeout, read-committed,
    /// starts a transaction, server messages not logged.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            isolation_level: IsolationLevel::default(),
            starts_transaction: true,
            log_server_messages: false,
        }
    }

    /// Set the command timeout. Zero disables the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the isolation level used for new transactions.
    pub fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    /// Set whether calls made with this context start their own transaction.
    pub fn with_starts_transaction(mut self, starts_transaction: bool) -> Self {
        self.starts_transaction = starts_transaction;
        self
    }

    /// Set whether server informational messages are forwarded to the log.
    pub fn with_log_server_messages(mut self, log_server_messages: bool) -> Self {
        self.log_server_messages = log_server_messages;
        self
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn starts_transaction(&self) -> bool {
        self.starts_transaction
    }

    pub fn log_server_messages(&self) -> bool {
        self.log_server_messages
    }

    /// Whether a connection target is configured at all.
    pub fn has_target(&self) -> bool {
        !self.connection_string.trim().is_empty()
    }

    /// Timeout to enforce per statement, `None` when unlimited.
    pub fn effective_timeout(&self) -> Option<Duration> {
        if self.command_timeout.is_zero() {
            None
        } else {
            Some(self.command_timeout)
        }
    }

    /// Backend detected from the connection string scheme.
    pub fn db_type(&self) -> Option<DatabaseType> {
        DatabaseType::from_connection_string(&self.connection_string)
    }

    /// Host name of the target, used as the server name in log output.
    pub fn server_name(&self) -> Option<String> {
        Url::parse(&self.connection_string)
            .ok()
            .and_then(|url| url.host_str().map(String::from))
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        mask_connection_string(&self.connection_string)
    }
}

/// Replace the password of a connection URL with `****`.
pub fn mask_connection_string(connection_string: &str) -> String {
    if let Ok(mut url) = Url::parse(connection_string) {
        if url.password().is_some() && url.set_password(Some("****")).is_ok() {
            return url.to_string();
        }
        return connection_string.to_string();
    }
    // Not a URL; fall back to masking anything between the last ':' and '@'
    if let Some(at_pos) = connection_string.find('@') {
        if let Some(colon_pos) = connection_string[..at_pos].rfind(':') {
            let prefix = &connection_string[..colon_pos + 1];
            let suffix = &connection_string[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }
    }
    connection_string.to_string()
}

/// Named timeout presets handed out by [`ExecutionContextFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TimeoutProfile {
    /// Configured short-running timeout
    Short,
    TenSeconds,
    ThirtySeconds,
    OneMinute,
    FiveMinutes,
    TenMinutes,
    OneHour,
    TwoHours,
    ThreeHours,
    /// Configured long-running timeout
    Long,
    /// No timeout at all
    Forever,
}

/// Builds execution contexts for one target with preset timeouts.
#[derive(Debug, Clone)]
pub struct ExecutionContextFactory {
    connection_string: String,
    isolation_level: IsolationLevel,
    short_running: Duration,
    long_running: Duration,
}

impl ExecutionContextFactory {
    pub fn new(
        connection_string: impl Into<String>,
        isolation_level: IsolationLevel,
        short_running: Duration,
        long_running: Duration,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            isolation_level,
            short_running,
            long_running,
        }
    }

    fn context(&self, timeout: Duration) -> ExecutionContext {
        ExecutionContext::new(self.connection_string.clone())
            .with_timeout(timeout)
            .with_isolation_level(self.isolation_level)
    }

    /// Context for a named preset.
    pub fn for_profile(&self, profile: TimeoutProfile) -> ExecutionContext {
        match profile {
            TimeoutProfile::Short => self.short_running(),
            TimeoutProfile::TenSeconds => self.ten_seconds(),
            TimeoutProfile::ThirtySeconds => self.thirty_seconds(),
            TimeoutProfile::OneMinute => self.one_minute(),
            TimeoutProfile::FiveMinutes => self.five_minutes(),
            TimeoutProfile::TenMinutes => self.ten_minutes(),
            TimeoutProfile::OneHour => self.one_hour(),
            TimeoutProfile::TwoHours => self.two_hours(),
            TimeoutProfile::ThreeHours => self.three_hours(),
            TimeoutProfile::Long => self.long_running(),
            TimeoutProfile::Forever => self.forever_running(),
        }
    }

    pub fn short_running(&self) -> ExecutionContext {
        self.context(self.short_running)
    }

    pub fn ten_seconds(&self) -> ExecutionContext {
        self.context(Duration::from_secs(10))
    }

    pub fn thirty_seconds(&self) -> ExecutionContext {
        self.context(Duration::from_secs(30))
    }

    pub fn one_minute(&self) -> ExecutionContext {
        self.context(Duration::from_secs(60))
    }

    pub fn five_minutes(&self) -> ExecutionContext {
        self.context(Duration::from_secs(5 * 60))
    }

    pub fn ten_minutes(&self) -> ExecutionContext {
        self.context(Duration::from_secs(10 * 60))
    }

    pub fn one_hour(&self) -> ExecutionContext {
        self.context(Duration::from_secs(3600))
    }

    pub fn two_hours(&self) -> ExecutionContext {
        self.context(Duration::from_secs(2 * 3600))
    }

    pub fn three_hours(&self) -> ExecutionContext {
        self.context(Duration::from_secs(3 * 3600))
    }

    pub fn long_running(&self) -> ExecutionContext {
        self.context(self.long_running)
    }

    /// Context without any command timeout.
    pub fn forever_running(&self) -> ExecutionContext {
        self.context(Duration::ZERO)
    }
}
