//! Replication positions
//!
//! A [`Position`] is the resumption token for a replication stream. The text
//! forms match what each server reports:
//!
//! - PostgreSQL LSN: `0/1949850` (hex high/low halves)
//! - MySQL binlog: `mysql-bin.000003:4` (file and byte offset)
//!
//! Positions are owned by the adapter that produced them and only ever move
//! forward within one streaming session. [`PositionStore`] persists the last
//! committed position to disk with atomic writes so an embedder can resume
//! after a restart.

use crate::common::error::{AuditStreamError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Adapter-specific resumption token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    /// PostgreSQL Log Sequence Number
    PostgresLsn(u64),
    /// MySQL binlog file and byte offset
    MysqlBinlog { file: String, offset: u64 },
}

impl Position {
    pub fn postgres_lsn(lsn: u64) -> Self {
        Self::PostgresLsn(lsn)
    }

    pub fn mysql_binlog(file: impl Into<String>, offset: u64) -> Self {
        Self::MysqlBinlog {
            file: file.into(),
            offset,
        }
    }

    /// The numeric LSN, when this is a PostgreSQL position.
    pub fn lsn(&self) -> Option<u64> {
        match self {
            Self::PostgresLsn(lsn) => Some(*lsn),
            _ => None,
        }
    }

    /// The binlog coordinates, when this is a MySQL position.
    pub fn binlog(&self) -> Option<(&str, u64)> {
        match self {
            Self::MysqlBinlog { file, offset } => Some((file.as_str(), *offset)),
            _ => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PostgresLsn(lsn) => {
                write!(f, "{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
            }
            Self::MysqlBinlog { file, offset } => write!(f, "{}:{}", file, offset),
        }
    }
}

impl FromStr for Position {
    type Err = AuditStreamError;

    /// Parse either text form. LSNs carry a `/`, binlog positions a `:`.
    fn from_str(s: &str) -> Result<Self> {
        if s.contains('/') {
            return parse_lsn(s)
                .map(Self::PostgresLsn)
                .ok_or_else(|| AuditStreamError::validation(format!("invalid LSN: {s}")));
        }
        if let Some((file, offset)) = s.rsplit_once(':') {
            if let Ok(offset) = offset.parse::<u64>() {
                if !file.is_empty() {
                    return Ok(Self::mysql_binlog(file, offset));
                }
            }
        }
        Err(AuditStreamError::validation(format!(
            "invalid replication position: {s}"
        )))
    }
}

/// Parse a PostgreSQL LSN string (`high/low` in hex) to u64.
pub fn parse_lsn(lsn: &str) -> Option<u64> {
    let (high, low) = lsn.split_once('/')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some((high << 32) | low)
}

/// Persistent storage for the last committed position of one stream.
///
/// Writes go to a sibling `.tmp` file and are renamed into place, so a crash
/// mid-write never corrupts the stored position.
pub struct PositionStore {
    path: PathBuf,
    fsync: bool,
    cache: RwLock<Option<Position>>,
}

impl PositionStore {
    /// Open a store backed by `path`, loading any previously saved position.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(path, true).await
    }

    /// Open with fsync control. Disabling fsync trades durability for write
    /// latency; only sensible in tests.
    pub async fn with_options(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let cache = match fs::read_to_string(&path).await {
            Ok(contents) => Some(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            fsync,
            cache: RwLock::new(cache),
        })
    }

    /// Persist `position`, replacing any previous one.
    pub async fn save(&self, position: &Position) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        let json = serde_json::to_string_pretty(position)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        *self.cache.write().await = Some(position.clone());
        debug!(position = %position, path = %self.path.display(), "saved position");
        Ok(())
    }

    /// The stored position, if any.
    pub async fn load(&self) -> Result<Option<Position>> {
        Ok(self.cache.read().await.clone())
    }

    /// Remove the stored position.
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        *self.cache.write().await = None;
        Ok(())
    }
}
