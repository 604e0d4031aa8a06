//! Error types for capture operations
//!
//! Feature-gated variants for database-specific errors, plus classification
//! helpers used by the retry loop and by log output.

use thiserror::Error;

/// Errors produced by the capture pipeline.
///
/// The variants split along how callers react to them: `Validation` and
/// `Configuration` are caller mistakes and never retried, `Adapter` means the
/// source or store is unreachable at start time, `Replication` covers protocol
/// state and decode failures during streaming and drives the supervision
/// retry loop, and `Persistence` marks a single dropped audit write.
#[derive(Error, Debug)]
pub enum AuditStreamError {
    /// Malformed change event construction or invalid action token
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid settings or unsupported adapter kind
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connectivity or setup failure at the adapter boundary
    #[error("adapter error: {0}")]
    Adapter(String),

    /// Replication protocol precondition or streaming decode failure
    #[error("replication error: {0}")]
    Replication(String),

    /// Audit record write failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// PostgreSQL driver error
    #[cfg(feature = "postgres")]
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// MySQL driver error
    #[cfg(feature = "mysql")]
    #[error("MySQL error: {0}")]
    Mysql(#[from] mysql_async::Error),
}

impl AuditStreamError {
    /// Create a new validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new adapter error
    pub fn adapter(msg: impl Into<String>) -> Self {
        Self::Adapter(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Check if this error is transient enough to retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Replication(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                        | ErrorKind::UnexpectedEof
                )
            }

            #[cfg(feature = "postgres")]
            Self::Postgres(e) => is_transient_pg_error(e),

            #[cfg(feature = "mysql")]
            Self::Mysql(e) => is_transient_mysql_error(e),

            Self::Validation(_)
            | Self::Configuration(_)
            | Self::Adapter(_)
            | Self::Persistence(_)
            | Self::Json(_) => false,
        }
    }

    /// Short label for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::Adapter(_) => "adapter",
            Self::Replication(_) => "replication",
            Self::Persistence(_) => "persistence",
            Self::Json(_) => "serialization",
            Self::Io(_) => "io",
            #[cfg(feature = "postgres")]
            Self::Postgres(_) => "database",
            #[cfg(feature = "mysql")]
            Self::Mysql(_) => "database",
        }
    }
}

/// Check if a PostgreSQL error is transient.
#[cfg(feature = "postgres")]
fn is_transient_pg_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_error) = e.as_db_error() {
        let code = db_error.code().code();
        // Connection exception class (08xxx)
        if code.starts_with("08") {
            return true;
        }
        // Transaction rollback class (40xxx)
        if code.starts_with("40") {
            return true;
        }
        // Insufficient resources class (53xxx)
        if code.starts_with("53") {
            return true;
        }
        // Operator intervention class (57xxx), except query_canceled
        if code.starts_with("57") && code != "57014" {
            return true;
        }
    }

    let msg = e.to_string().to_lowercase();
    msg.contains("connection") || msg.contains("closed") || msg.contains("timeout")
}

/// Check if a MySQL error is transient.
#[cfg(feature = "mysql")]
fn is_transient_mysql_error(e: &mysql_async::Error) -> bool {
    match e {
        mysql_async::Error::Io(_) => true,
        // 1040 too many connections, 1053 shutdown in progress,
        // 1205 lock wait timeout, 1213 deadlock
        mysql_async::Error::Server(server) => {
            matches!(server.code, 1040 | 1053 | 1205 | 1213)
        }
        _ => false,
    }
}

/// Result type for capture operations
pub type Result<T> = std::result::Result<T, AuditStreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AuditStreamError::replication("connection lost");
        assert!(err.to_string().contains("replication error"));
        assert!(err.to_string().contains("connection lost"));

        let err = AuditStreamError::validation("invalid action");
        assert_eq!(err.to_string(), "validation failed: invalid action");
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(AuditStreamError::replication("slot busy").is_retriable());

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(AuditStreamError::from(reset).is_retriable());

        assert!(!AuditStreamError::validation("bad event").is_retriable());
        assert!(!AuditStreamError::configuration("bad url").is_retriable());
        assert!(!AuditStreamError::adapter("unreachable").is_retriable());
        assert!(!AuditStreamError::persistence("constraint").is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(AuditStreamError::replication("x").category(), "replication");
        assert_eq!(
            AuditStreamError::configuration("x").category(),
            "configuration"
        );
        assert_eq!(AuditStreamError::adapter("x").category(), "adapter");
        assert_eq!(AuditStreamError::persistence("x").category(), "persistence");
        assert_eq!(AuditStreamError::validation("x").category(), "validation");
    }
}
