//! PostgreSQL logical replication wire protocol
//!
//! Hand-rolled TCP frontend speaking the streaming replication subprotocol
//! (startup with `replication=database`, `IDENTIFY_SYSTEM`,
//! `START_REPLICATION`) plus the pgoutput v1 message decoder.

pub mod client;
pub mod decoder;
pub mod message;

pub use client::{IdentifySystem, ReplicationClient, ReplicationStream};
pub use decoder::{DecodeError, DecodedMessage, PgOutputDecoder, PostgresDecode, RowChange};
pub use message::*;

/// Seconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub(crate) const POSTGRES_EPOCH_UNIX_SECS: i64 = 946_684_800;
