//! pgoutput decoding
//!
//! Two layers: a bounds-checked parser from raw bytes to
//! [`ReplicationMessage`], and the stateful [`PgOutputDecoder`] that owns the
//! relation cache and turns parsed messages into [`DecodedMessage`] values
//! the streaming loop can act on. The loop only depends on the
//! [`PostgresDecode`] trait, so tests can drive it with a scripted decoder.

use super::message::*;
use super::POSTGRES_EPOCH_UNIX_SECS;
use crate::common::{Action, AuditStreamError, ColumnMap, Result};
use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

type ParseResult<T> = std::result::Result<T, DecodeError>;

/// Low-level pgoutput parse failure.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("truncated message")]
    NotEnoughData,
    #[error("unexpected message type byte {0:#04x}")]
    InvalidType(u8),
    #[error("utf8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("unknown relation {0}, no Relation message seen for it")]
    UnknownRelation(u32),
}

impl From<DecodeError> for AuditStreamError {
    fn from(err: DecodeError) -> Self {
        AuditStreamError::replication(err.to_string())
    }
}

/// Outcome of decoding one replication payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// A transaction opened; row changes follow until `Commit`.
    Begin {
        xid: u32,
        committed_at: DateTime<Utc>,
    },
    /// The open transaction committed; buffered changes are durable.
    Commit { commit_lsn: u64, end_lsn: u64 },
    /// One row changed.
    Change(RowChange),
    /// Bookkeeping message with no row payload (relation, type, origin,
    /// truncate).
    Internal,
}

/// A decoded row mutation, not yet assembled into a change event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub schema: String,
    pub table: String,
    pub action: Action,
    pub key: ColumnMap,
    pub before: Option<ColumnMap>,
    pub after: Option<ColumnMap>,
}

/// Decoder seam for the PostgreSQL streaming loop.
pub trait PostgresDecode: Send + Sync {
    /// Decode one XLogData payload. Errors mean this payload is skipped;
    /// the stream itself continues.
    fn decode(&mut self, payload: &mut Bytes) -> Result<DecodedMessage>;
}

/// Default decoder for pgoutput protocol version 1.
///
/// Caches `Relation` messages by OID so later row messages can be zipped
/// with column names. The server resends a relation whenever its schema
/// changes, which overwrites the cached entry.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationBody>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn relation(&self, id: u32) -> ParseResult<&RelationBody> {
        self.relations.get(&id).ok_or(DecodeError::UnknownRelation(id))
    }

    fn interpret(&mut self, message: ReplicationMessage) -> ParseResult<DecodedMessage> {
        match message {
            ReplicationMessage::Begin(body) => Ok(DecodedMessage::Begin {
                xid: body.xid,
                committed_at: pg_timestamp_to_utc(body.timestamp),
            }),
            ReplicationMessage::Commit(body) => Ok(DecodedMessage::Commit {
                commit_lsn: body.commit_lsn,
                end_lsn: body.end_lsn,
            }),
            ReplicationMessage::Relation(rel) => {
                debug!(
                    relation = rel.id,
                    table = %format!("{}.{}", rel.namespace, rel.name),
                    columns = rel.columns.len(),
                    "cached relation schema"
                );
                self.relations.insert(rel.id, rel);
                Ok(DecodedMessage::Internal)
            }
            ReplicationMessage::Insert(body) => {
                let rel = self.relation(body.relation_id)?;
                let after = row_image(rel, &body.tuple);
                let key = key_columns(rel, &after);
                Ok(DecodedMessage::Change(RowChange {
                    schema: rel.namespace.clone(),
                    table: rel.name.clone(),
                    action: Action::Insert,
                    key,
                    before: None,
                    after: Some(after),
                }))
            }
            ReplicationMessage::Update(body) => {
                let rel = self.relation(body.relation_id)?;
                let after = row_image(rel, &body.new_tuple);
                // Without an old tuple the replica identity columns are
                // known unchanged, so the before image falls back to them.
                let before = match &body.old_tuple {
                    Some(old) => row_image(rel, old),
                    None => key_columns(rel, &after),
                };
                let key = key_columns(rel, &before);
                Ok(DecodedMessage::Change(RowChange {
                    schema: rel.namespace.clone(),
                    table: rel.name.clone(),
                    action: Action::Update,
                    key,
                    before: Some(before),
                    after: Some(after),
                }))
            }
            ReplicationMessage::Delete(body) => {
                let rel = self.relation(body.relation_id)?;
                let before = row_image(rel, &body.old_tuple);
                let key = key_columns(rel, &before);
                Ok(DecodedMessage::Change(RowChange {
                    schema: rel.namespace.clone(),
                    table: rel.name.clone(),
                    action: Action::Delete,
                    key,
                    before: Some(before),
                    after: None,
                }))
            }
            ReplicationMessage::Origin(body) => {
                debug!(origin = %body.name, "ignoring origin message");
                Ok(DecodedMessage::Internal)
            }
            ReplicationMessage::Type(_) => Ok(DecodedMessage::Internal),
            ReplicationMessage::Truncate(body) => {
                debug!(
                    relations = body.relation_ids.len(),
                    "truncate is not mapped to change events"
                );
                Ok(DecodedMessage::Internal)
            }
        }
    }
}

impl PostgresDecode for PgOutputDecoder {
    fn decode(&mut self, payload: &mut Bytes) -> Result<DecodedMessage> {
        let message = parse(payload)?;
        Ok(self.interpret(message)?)
    }
}

/// Zip a tuple with the relation's column names into a JSON image.
/// Unchanged TOAST columns were not transmitted and are omitted.
fn row_image(rel: &RelationBody, tuple: &Tuple) -> ColumnMap {
    let mut image = ColumnMap::new();
    for (column, data) in rel.columns.iter().zip(&tuple.0) {
        match data {
            TupleData::Null => {
                image.insert(column.name.clone(), Value::Null);
            }
            TupleData::Toast => {}
            TupleData::Text(bytes) => {
                image.insert(column.name.clone(), coerce_text(bytes));
            }
        }
    }
    image
}

/// Replica identity columns of an image.
fn key_columns(rel: &RelationBody, image: &ColumnMap) -> ColumnMap {
    rel.columns
        .iter()
        .filter(|column| column.is_key())
        .filter_map(|column| {
            image
                .get(&column.name)
                .map(|value| (column.name.clone(), value.clone()))
        })
        .collect()
}

/// pgoutput transmits every value in text format. Booleans arrive as
/// `t`/`f` and numbers in strict JSON syntax; both are promoted so audit
/// records carry typed values. Anything else stays a string, including
/// zero-padded digits like "007" which are not valid JSON numbers.
fn coerce_text(bytes: &Bytes) -> Value {
    let text = String::from_utf8_lossy(bytes);
    match text.as_ref() {
        "t" | "true" => return Value::Bool(true),
        "f" | "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(number) = text.parse::<serde_json::Number>() {
        return Value::Number(number);
    }
    Value::String(text.into_owned())
}

fn pg_timestamp_to_utc(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros.saturating_add(POSTGRES_EPOCH_UNIX_SECS * 1_000_000))
        .unwrap_or_else(Utc::now)
}

fn parse(data: &mut Bytes) -> ParseResult<ReplicationMessage> {
    if !data.has_remaining() {
        return Err(DecodeError::NotEnoughData);
    }

    match data.get_u8() {
        b'B' => parse_begin(data).map(ReplicationMessage::Begin),
        b'C' => parse_commit(data).map(ReplicationMessage::Commit),
        b'O' => parse_origin(data).map(ReplicationMessage::Origin),
        b'R' => parse_relation(data).map(ReplicationMessage::Relation),
        b'Y' => parse_type(data).map(ReplicationMessage::Type),
        b'I' => parse_insert(data).map(ReplicationMessage::Insert),
        b'U' => parse_update(data).map(ReplicationMessage::Update),
        b'D' => parse_delete(data).map(ReplicationMessage::Delete),
        b'T' => parse_truncate(data).map(ReplicationMessage::Truncate),
        t => Err(DecodeError::InvalidType(t)),
    }
}

fn need(buf: &Bytes, bytes: usize) -> ParseResult<()> {
    if buf.remaining() < bytes {
        return Err(DecodeError::NotEnoughData);
    }
    Ok(())
}

fn parse_begin(buf: &mut Bytes) -> ParseResult<BeginBody> {
    need(buf, 20)?;
    Ok(BeginBody {
        final_lsn: buf.get_u64(),
        timestamp: buf.get_i64(),
        xid: buf.get_u32(),
    })
}

fn parse_commit(buf: &mut Bytes) -> ParseResult<CommitBody> {
    need(buf, 25)?;
    Ok(CommitBody {
        flags: buf.get_u8(),
        commit_lsn: buf.get_u64(),
        end_lsn: buf.get_u64(),
        timestamp: buf.get_i64(),
    })
}

fn parse_origin(buf: &mut Bytes) -> ParseResult<OriginBody> {
    need(buf, 8)?;
    let commit_lsn = buf.get_u64();
    let name = read_cstr(buf)?;
    Ok(OriginBody { commit_lsn, name })
}

fn parse_relation(buf: &mut Bytes) -> ParseResult<RelationBody> {
    need(buf, 4)?;
    let id = buf.get_u32();
    let namespace = read_cstr(buf)?;
    let name = read_cstr(buf)?;
    need(buf, 3)?;
    let replica_identity = buf.get_u8();
    let num_columns = buf.get_u16();

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        need(buf, 1)?;
        let flags = buf.get_u8();
        let column_name = read_cstr(buf)?;
        need(buf, 8)?;
        columns.push(Column {
            flags,
            name: column_name,
            type_id: buf.get_i32(),
            type_mode: buf.get_i32(),
        });
    }

    Ok(RelationBody {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn parse_type(buf: &mut Bytes) -> ParseResult<TypeBody> {
    need(buf, 4)?;
    let id = buf.get_u32();
    let namespace = read_cstr(buf)?;
    let name = read_cstr(buf)?;
    Ok(TypeBody {
        id,
        namespace,
        name,
    })
}

fn parse_insert(buf: &mut Bytes) -> ParseResult<InsertBody> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    let marker = buf.get_u8();
    if marker != b'N' {
        return Err(DecodeError::Protocol(format!(
            "expected new tuple marker 'N' in insert, got {:#04x}",
            marker
        )));
    }
    let tuple = parse_tuple(buf)?;
    Ok(InsertBody { relation_id, tuple })
}

fn parse_update(buf: &mut Bytes) -> ParseResult<UpdateBody> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();

    // K carries the old key columns, O the full old row, N goes straight
    // to the new tuple.
    let (old_tuple, new_tuple) = match buf.get_u8() {
        marker @ (b'K' | b'O') => {
            let old = parse_tuple(buf)?;
            need(buf, 1)?;
            let next = buf.get_u8();
            if next != b'N' {
                return Err(DecodeError::Protocol(format!(
                    "expected 'N' after '{}' tuple in update, got {:#04x}",
                    marker as char, next
                )));
            }
            (Some(old), parse_tuple(buf)?)
        }
        b'N' => (None, parse_tuple(buf)?),
        t => return Err(DecodeError::InvalidType(t)),
    };

    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn parse_delete(buf: &mut Bytes) -> ParseResult<DeleteBody> {
    need(buf, 5)?;
    let relation_id = buf.get_u32();
    let old_tuple = match buf.get_u8() {
        b'K' | b'O' => parse_tuple(buf)?,
        t => return Err(DecodeError::InvalidType(t)),
    };
    Ok(DeleteBody {
        relation_id,
        old_tuple,
    })
}

fn parse_truncate(buf: &mut Bytes) -> ParseResult<TruncateBody> {
    need(buf, 5)?;
    let num_relations = buf.get_u32();
    let options = buf.get_u8();
    need(buf, num_relations as usize * 4)?;
    let mut relation_ids = Vec::with_capacity(num_relations as usize);
    for _ in 0..num_relations {
        relation_ids.push(buf.get_u32());
    }
    Ok(TruncateBody {
        relation_ids,
        options,
    })
}

fn read_cstr(buf: &mut Bytes) -> ParseResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(DecodeError::NotEnoughData)?;
    let raw = buf.copy_to_bytes(end);
    buf.advance(1); // terminator
    Ok(std::str::from_utf8(&raw)?.to_string())
}

fn parse_tuple(buf: &mut Bytes) -> ParseResult<Tuple> {
    need(buf, 2)?;
    let num_columns = buf.get_u16();
    let mut columns = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        need(buf, 1)?;
        let data = match buf.get_u8() {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                need(buf, 4)?;
                let len = buf.get_u32() as usize;
                need(buf, len)?;
                TupleData::Text(buf.copy_to_bytes(len))
            }
            t => return Err(DecodeError::InvalidType(t)),
        };
        columns.push(data);
    }

    Ok(Tuple(columns))
}
