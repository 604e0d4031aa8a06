//! Input validation for capture configuration and protocol frames
//!
//! Protects against:
//! - SQL injection via identifier validation (slot, publication, table names)
//! - Resource exhaustion via frame size limits

use crate::common::error::{AuditStreamError, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Maximum allowed identifier length
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Maximum replication frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Connection establishment timeout (seconds)
pub const CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Read/write timeout on protocol sockets (seconds)
pub const IO_TIMEOUT_SECS: u64 = 60;

static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,254}$").unwrap());

/// Validator for capture inputs
pub struct Validator;

impl Validator {
    /// Validate a SQL identifier (slot name, publication name, table name).
    ///
    /// Identifiers are interpolated into replication DDL, so anything outside
    /// `[a-zA-Z_][a-zA-Z0-9_]*` is rejected outright.
    pub fn validate_identifier(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(AuditStreamError::configuration(
                "identifier cannot be empty",
            ));
        }

        if name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(AuditStreamError::configuration(format!(
                "identifier too long: {} chars (max: {})",
                name.len(),
                MAX_IDENTIFIER_LENGTH
            )));
        }

        if !IDENTIFIER_REGEX.is_match(name) {
            return Err(AuditStreamError::configuration(format!(
                "invalid identifier '{}': must start with letter/underscore and contain only alphanumeric characters and underscores",
                name
            )));
        }

        Ok(())
    }

    /// Validate a source or audit connection URL.
    pub fn validate_connection_url(url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(AuditStreamError::configuration(
                "connection URL cannot be empty",
            ));
        }

        let valid_schemes = ["postgres://", "postgresql://", "mysql://", "mariadb://"];
        if !valid_schemes.iter().any(|s| url.starts_with(s)) {
            return Err(AuditStreamError::configuration(format!(
                "invalid connection URL scheme, expected one of: {:?}",
                valid_schemes
            )));
        }

        Ok(())
    }

    /// Reject replication frames beyond the size cap.
    pub fn validate_frame_size(size: usize) -> Result<()> {
        if size > MAX_FRAME_SIZE {
            return Err(AuditStreamError::replication(format!(
                "frame size {} bytes exceeds maximum {}",
                size, MAX_FRAME_SIZE
            )));
        }
        Ok(())
    }
}
