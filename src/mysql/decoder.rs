//! Binlog event decoding
//!
//! Bounds-checked parsers from raw binlog frames to [`BinlogEvent`] values,
//! plus the stateful [`BinlogDecoder`] that tracks the format description
//! and table map events a dump session interleaves with row events. Column
//! values decode to [`ColumnValue`] and render to JSON positionally; column
//! names come from the catalog, not the binlog.

use crate::common::{AuditStreamError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{Buf, Bytes};
use chrono::{DateTime, Datelike, Timelike};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

type ParseResult<T> = std::result::Result<T, BinlogError>;

/// Low-level binlog parse failure.
#[derive(Error, Debug)]
pub enum BinlogError {
    #[error("truncated event")]
    NotEnoughData,
    #[error("unknown column type {0}")]
    UnknownColumnType(u8),
    #[error("unknown table id {0}, no table map seen for it")]
    UnknownTable(u64),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<BinlogError> for AuditStreamError {
    fn from(err: BinlogError) -> Self {
        AuditStreamError::replication(err.to_string())
    }
}

/// Binlog event type byte, for the events this pipeline reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Query,
    Rotate,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Heartbeat,
    WriteRowsV2,
    UpdateRowsV2,
    DeleteRowsV2,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    Other(u8),
}

impl EventType {
    fn from_u8(value: u8) -> Self {
        match value {
            0x02 => Self::Query,
            0x04 => Self::Rotate,
            0x0F => Self::FormatDescription,
            0x10 => Self::Xid,
            0x13 => Self::TableMap,
            0x17 => Self::WriteRowsV1,
            0x18 => Self::UpdateRowsV1,
            0x19 => Self::DeleteRowsV1,
            0x1B => Self::Heartbeat,
            0x1E => Self::WriteRowsV2,
            0x1F => Self::UpdateRowsV2,
            0x20 => Self::DeleteRowsV2,
            0x21 => Self::Gtid,
            0x22 => Self::AnonymousGtid,
            0x23 => Self::PreviousGtids,
            other => Self::Other(other),
        }
    }
}

/// Column type byte from a table map event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Decimal,
    Tiny,
    Short,
    Long,
    Float,
    Double,
    Null,
    Timestamp,
    LongLong,
    Int24,
    Date,
    Time,
    DateTime,
    Year,
    Varchar,
    Bit,
    Timestamp2,
    DateTime2,
    Time2,
    Json,
    NewDecimal,
    Enum,
    Set,
    TinyBlob,
    MediumBlob,
    LongBlob,
    Blob,
    VarString,
    String,
    Geometry,
}

impl ColumnType {
    fn from_u8(value: u8) -> ParseResult<Self> {
        Ok(match value {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            other => return Err(BinlogError::UnknownColumnType(other)),
        })
    }
}

/// Common 19-byte header on every binlog event.
#[derive(Debug, Clone, Copy)]
pub struct EventHeader {
    /// Event creation time, seconds since the Unix epoch.
    pub timestamp: u32,
    pub event_type: EventType,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset of the event following this one in the current binlog file.
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    fn parse(buf: &mut Bytes) -> ParseResult<Self> {
        need(buf, Self::SIZE)?;
        Ok(Self {
            timestamp: buf.get_u32_le(),
            event_type: EventType::from_u8(buf.get_u8()),
            server_id: buf.get_u32_le(),
            event_length: buf.get_u32_le(),
            next_position: buf.get_u32_le(),
            flags: buf.get_u16_le(),
        })
    }
}

/// First event of every binlog file.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    /// Whether subsequent events in this file carry a trailing CRC32.
    pub checksum_crc32: bool,
}

/// Table metadata preceding each run of row events.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<ColumnType>,
    /// Per-column metadata packed per type (lengths, precision, fsp).
    pub column_metadata: Vec<u16>,
}

/// Decoded row mutations for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub table_id: u64,
    pub rows: Vec<RowImage>,
}

/// One row's images, positionally aligned with the table map columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    pub before: Option<Vec<ColumnValue>>,
    pub after: Option<Vec<ColumnValue>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub schema: String,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RotateEvent {
    /// First event offset in the next file, normally 4.
    pub position: u64,
    pub next_file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GtidEvent {
    pub uuid: [u8; 16],
    pub sequence: u64,
}

impl GtidEvent {
    /// `uuid:sequence` in the usual dashed form.
    pub fn gtid(&self) -> String {
        let hex: String = self.uuid.iter().map(|b| format!("{b:02x}")).collect();
        format!(
            "{}-{}-{}-{}-{}:{}",
            &hex[0..8],
            &hex[8..12],
            &hex[12..16],
            &hex[16..20],
            &hex[20..32],
            self.sequence
        )
    }
}

/// Outcome of decoding one binlog frame.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    TableMap(TableMapEvent),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    /// Transaction commit with its transaction id.
    Xid(u64),
    Query(QueryEvent),
    Rotate(RotateEvent),
    Gtid(GtidEvent),
    Heartbeat,
    /// Event type this pipeline has no use for (stop, previous-gtids, ...).
    Ignored(EventType),
}

/// A decoded MySQL column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    SignedInt(i64),
    UnsignedInt(u64),
    Float(f32),
    Double(f64),
    /// Exact decimal rendered to its text form.
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        negative: bool,
        hours: u32,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    Year(u16),
    /// Ordinal into the column's value list; names need the table DDL.
    Enum(u16),
    /// Member bitmask; names need the table DDL.
    Set(u64),
    Bit(Vec<u8>),
}

impl ColumnValue {
    /// Render for an audit record. Binary payloads become base64 text,
    /// temporal values ISO-8601-style strings.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::SignedInt(v) => json!(v),
            Self::UnsignedInt(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::Double(v) => json!(v),
            Self::Decimal(v) => json!(v),
            Self::Text(v) => json!(v),
            Self::Bytes(v) => json!(BASE64.encode(v)),
            Self::Json(v) => v.clone(),
            Self::Date { year, month, day } => {
                json!(format!("{year:04}-{month:02}-{day:02}"))
            }
            Self::Time {
                negative,
                hours,
                minutes,
                seconds,
                micros,
            } => {
                let sign = if *negative { "-" } else { "" };
                let mut text = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
                if *micros > 0 {
                    text.push_str(&format!(".{micros:06}"));
                }
                json!(text)
            }
            Self::DateTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            } => {
                let mut text = format!(
                    "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}"
                );
                if *micros > 0 {
                    text.push_str(&format!(".{micros:06}"));
                }
                json!(text)
            }
            Self::Year(v) => json!(v),
            Self::Enum(v) => json!(v),
            Self::Set(v) => json!(v),
            Self::Bit(v) => json!(BASE64.encode(v)),
        }
    }
}

/// Stateful decoder for one dump session.
///
/// Caches table map events by table id so row events can be decoded, and
/// learns from the format description event whether the server appends
/// CRC32 checksums that must be stripped before parsing.
pub struct BinlogDecoder {
    table_maps: HashMap<u64, TableMapEvent>,
    strip_checksum: bool,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self {
            table_maps: HashMap::new(),
            strip_checksum: false,
        }
    }

    /// Preset checksum stripping for events arriving before the first
    /// format description event, like the server's artificial rotate at
    /// dump start. The format description remains authoritative.
    pub fn set_checksum(&mut self, strip: bool) {
        self.strip_checksum = strip;
    }

    /// Last table map seen for this table id, if any.
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_maps.get(&table_id)
    }

    /// Decode one event frame. Errors mean this frame is skipped; the
    /// stream itself continues.
    pub fn decode(&mut self, frame: &Bytes) -> Result<(EventHeader, BinlogEvent)> {
        let mut buf = frame.clone();
        let header = EventHeader::parse(&mut buf)?;

        if header.event_type == EventType::FormatDescription {
            let fde = parse_format_description(&mut buf)?;
            self.strip_checksum = fde.checksum_crc32;
            // New binlog file, old table ids no longer apply.
            self.table_maps.clear();
            debug!(
                version = %fde.server_version,
                crc32 = fde.checksum_crc32,
                "format description"
            );
            return Ok((header, BinlogEvent::FormatDescription(fde)));
        }

        if self.strip_checksum {
            if buf.len() < 4 {
                return Err(BinlogError::NotEnoughData.into());
            }
            buf.truncate(buf.len() - 4);
        }

        let event = match header.event_type {
            EventType::TableMap => {
                let table = parse_table_map(&mut buf)?;
                self.table_maps.insert(table.table_id, table.clone());
                BinlogEvent::TableMap(table)
            }
            EventType::WriteRowsV1 | EventType::WriteRowsV2 => {
                BinlogEvent::WriteRows(self.parse_rows(&mut buf, header.event_type)?)
            }
            EventType::UpdateRowsV1 | EventType::UpdateRowsV2 => {
                BinlogEvent::UpdateRows(self.parse_rows(&mut buf, header.event_type)?)
            }
            EventType::DeleteRowsV1 | EventType::DeleteRowsV2 => {
                BinlogEvent::DeleteRows(self.parse_rows(&mut buf, header.event_type)?)
            }
            EventType::Xid => {
                need(&buf, 8)?;
                BinlogEvent::Xid(buf.get_u64_le())
            }
            EventType::Query => BinlogEvent::Query(parse_query(&mut buf)?),
            EventType::Rotate => BinlogEvent::Rotate(parse_rotate(&mut buf)?),
            EventType::Gtid | EventType::AnonymousGtid => {
                BinlogEvent::Gtid(parse_gtid(&mut buf)?)
            }
            EventType::Heartbeat => BinlogEvent::Heartbeat,
            other => BinlogEvent::Ignored(other),
        };
        Ok((header, event))
    }

    fn parse_rows(&self, buf: &mut Bytes, event_type: EventType) -> ParseResult<RowsEvent> {
        let table_id = read_table_id(buf)?;
        need(buf, 2)?;
        let _flags = buf.get_u16_le();

        if matches!(
            event_type,
            EventType::WriteRowsV2 | EventType::UpdateRowsV2 | EventType::DeleteRowsV2
        ) {
            need(buf, 2)?;
            // The length counts its own two bytes.
            let extra = (buf.get_u16_le() as usize).saturating_sub(2);
            need(buf, extra)?;
            buf.advance(extra);
        }

        let table = self
            .table_maps
            .get(&table_id)
            .ok_or(BinlogError::UnknownTable(table_id))?;

        let column_count = read_packed_int(buf)? as usize;
        if column_count != table.column_types.len() {
            return Err(BinlogError::Protocol(format!(
                "rows event declares {column_count} columns, table map has {}",
                table.column_types.len()
            )));
        }

        let bitmap_len = column_count.div_ceil(8);
        need(buf, bitmap_len)?;
        let before_present = buf.split_to(bitmap_len).to_vec();
        let is_update = matches!(
            event_type,
            EventType::UpdateRowsV1 | EventType::UpdateRowsV2
        );
        let after_present = if is_update {
            need(buf, bitmap_len)?;
            buf.split_to(bitmap_len).to_vec()
        } else {
            before_present.clone()
        };

        let has_before = is_update
            || matches!(
                event_type,
                EventType::DeleteRowsV1 | EventType::DeleteRowsV2
            );
        let has_after = is_update
            || matches!(event_type, EventType::WriteRowsV1 | EventType::WriteRowsV2);

        let mut rows = Vec::new();
        while buf.has_remaining() {
            let before = if has_before {
                Some(decode_row_image(buf, table, &before_present)?)
            } else {
                None
            };
            let after = if has_after {
                Some(decode_row_image(buf, table, &after_present)?)
            } else {
                None
            };
            rows.push(RowImage { before, after });
        }

        Ok(RowsEvent { table_id, rows })
    }
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_format_description(buf: &mut Bytes) -> ParseResult<FormatDescriptionEvent> {
    need(buf, 57)?;
    let binlog_version = buf.get_u16_le();
    let mut version_raw = [0u8; 50];
    buf.copy_to_slice(&mut version_raw);
    let server_version = String::from_utf8_lossy(&version_raw)
        .trim_end_matches('\0')
        .to_string();
    let _create_timestamp = buf.get_u32_le();
    let _header_length = buf.get_u8();

    // What remains is the per-event-type post-header length array, followed
    // on checksum-aware servers by an algorithm byte and the event's own
    // CRC32. Pre-5.6 servers end with the array, so gate on the version.
    let checksum_crc32 = version_signals_checksum(&server_version)
        && buf.remaining() >= 5
        && buf[buf.remaining() - 5] == 1;

    Ok(FormatDescriptionEvent {
        binlog_version,
        server_version,
        checksum_crc32,
    })
}

/// Checksums exist since MySQL 5.6 and MariaDB 5.3.
fn version_signals_checksum(version: &str) -> bool {
    let mut numbers = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<u32>().ok());
    let (Some(major), Some(minor)) = (numbers.next(), numbers.next()) else {
        return false;
    };
    if version.contains("MariaDB") {
        (major, minor) >= (5, 3)
    } else {
        (major, minor) >= (5, 6)
    }
}

fn parse_table_map(buf: &mut Bytes) -> ParseResult<TableMapEvent> {
    let table_id = read_table_id(buf)?;
    need(buf, 2)?;
    let _flags = buf.get_u16_le();

    let schema = take_prefixed_name(buf)?;
    let table = take_prefixed_name(buf)?;

    let column_count = read_packed_int(buf)? as usize;
    need(buf, column_count)?;
    let mut column_types = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        column_types.push(ColumnType::from_u8(buf.get_u8())?);
    }

    let metadata_len = read_packed_int(buf)? as usize;
    need(buf, metadata_len)?;
    let mut metadata_buf = buf.split_to(metadata_len);
    let mut column_metadata = Vec::with_capacity(column_count);
    for column_type in &column_types {
        column_metadata.push(read_column_metadata(&mut metadata_buf, *column_type)?);
    }

    // The nullability bitmap and the 8.0 optional metadata follow; neither
    // is needed to decode row images.
    Ok(TableMapEvent {
        table_id,
        schema,
        table,
        column_types,
        column_metadata,
    })
}

/// Length-prefixed, nul-terminated name as used in table map events.
fn take_prefixed_name(buf: &mut Bytes) -> ParseResult<String> {
    need(buf, 1)?;
    let len = buf.get_u8() as usize;
    need(buf, len + 1)?;
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len + 1);
    Ok(name)
}

fn read_column_metadata(buf: &mut Bytes, column_type: ColumnType) -> ParseResult<u16> {
    Ok(match column_type {
        ColumnType::Float
        | ColumnType::Double
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Blob
        | ColumnType::Json
        | ColumnType::Geometry
        | ColumnType::Timestamp2
        | ColumnType::DateTime2
        | ColumnType::Time2 => {
            need(buf, 1)?;
            buf.get_u8() as u16
        }
        ColumnType::Varchar | ColumnType::VarString => {
            need(buf, 2)?;
            buf.get_u16_le()
        }
        // Stored as [real type or precision, length or scale].
        ColumnType::String | ColumnType::Enum | ColumnType::Set | ColumnType::NewDecimal => {
            need(buf, 2)?;
            ((buf.get_u8() as u16) << 8) | buf.get_u8() as u16
        }
        ColumnType::Bit => {
            need(buf, 2)?;
            let bits = buf.get_u8() as u16;
            let bytes = buf.get_u8() as u16;
            (bytes << 8) | bits
        }
        _ => 0,
    })
}

fn parse_query(buf: &mut Bytes) -> ParseResult<QueryEvent> {
    need(buf, 13)?;
    let _thread_id = buf.get_u32_le();
    let _exec_time = buf.get_u32_le();
    let schema_len = buf.get_u8() as usize;
    let _error_code = buf.get_u16_le();
    let status_len = buf.get_u16_le() as usize;

    need(buf, status_len + schema_len + 1)?;
    buf.advance(status_len);
    let schema = String::from_utf8_lossy(&buf[..schema_len]).into_owned();
    buf.advance(schema_len + 1);
    let query = String::from_utf8_lossy(&buf[..]).into_owned();
    Ok(QueryEvent { schema, query })
}

fn parse_rotate(buf: &mut Bytes) -> ParseResult<RotateEvent> {
    need(buf, 8)?;
    let position = buf.get_u64_le();
    let next_file = String::from_utf8_lossy(&buf[..]).into_owned();
    Ok(RotateEvent {
        position,
        next_file,
    })
}

fn parse_gtid(buf: &mut Bytes) -> ParseResult<GtidEvent> {
    need(buf, 25)?;
    let _flags = buf.get_u8();
    let mut uuid = [0u8; 16];
    buf.copy_to_slice(&mut uuid);
    let sequence = buf.get_u64_le();
    Ok(GtidEvent { uuid, sequence })
}

fn decode_row_image(
    buf: &mut Bytes,
    table: &TableMapEvent,
    present: &[u8],
) -> ParseResult<Vec<ColumnValue>> {
    let null_len = count_set_bits(present).div_ceil(8);
    need(buf, null_len)?;
    let null_bitmap = buf.split_to(null_len).to_vec();

    let mut values = Vec::with_capacity(table.column_types.len());
    let mut image_index = 0;
    for (column, column_type) in table.column_types.iter().enumerate() {
        if !is_bit_set(present, column) {
            // Column absent from the image; keep positional alignment.
            values.push(ColumnValue::Null);
            continue;
        }
        if is_bit_set(&null_bitmap, image_index) {
            values.push(ColumnValue::Null);
        } else {
            values.push(decode_value(
                buf,
                *column_type,
                table.column_metadata[column],
            )?);
        }
        image_index += 1;
    }
    Ok(values)
}

fn decode_value(
    buf: &mut Bytes,
    column_type: ColumnType,
    metadata: u16,
) -> ParseResult<ColumnValue> {
    Ok(match column_type {
        ColumnType::Null => ColumnValue::Null,
        ColumnType::Tiny => {
            need(buf, 1)?;
            ColumnValue::SignedInt(buf.get_i8() as i64)
        }
        ColumnType::Short => {
            need(buf, 2)?;
            ColumnValue::SignedInt(buf.get_i16_le() as i64)
        }
        ColumnType::Int24 => {
            need(buf, 3)?;
            let raw = buf.get_uint_le(3) as u32;
            let value = if raw & 0x80_0000 != 0 {
                (raw | 0xFF00_0000) as i32
            } else {
                raw as i32
            };
            ColumnValue::SignedInt(value as i64)
        }
        ColumnType::Long => {
            need(buf, 4)?;
            ColumnValue::SignedInt(buf.get_i32_le() as i64)
        }
        ColumnType::LongLong => {
            need(buf, 8)?;
            ColumnValue::SignedInt(buf.get_i64_le())
        }
        ColumnType::Float => {
            need(buf, 4)?;
            ColumnValue::Float(buf.get_f32_le())
        }
        ColumnType::Double => {
            need(buf, 8)?;
            ColumnValue::Double(buf.get_f64_le())
        }
        ColumnType::Year => {
            need(buf, 1)?;
            ColumnValue::Year(1900 + buf.get_u8() as u16)
        }
        ColumnType::Date => {
            need(buf, 3)?;
            let packed = buf.get_uint_le(3) as u32;
            ColumnValue::Date {
                year: (packed >> 9) as u16,
                month: ((packed >> 5) & 0x0F) as u8,
                day: (packed & 0x1F) as u8,
            }
        }
        ColumnType::Time => {
            need(buf, 3)?;
            let packed = buf.get_uint_le(3) as u32;
            ColumnValue::Time {
                negative: false,
                hours: packed / 10_000,
                minutes: ((packed / 100) % 100) as u8,
                seconds: (packed % 100) as u8,
                micros: 0,
            }
        }
        ColumnType::Time2 => {
            need(buf, 3)?;
            let packed = buf.get_uint(3) as u32;
            // Stored offset by the sign bit; clear bit means negative.
            let (negative, value) = if packed & 0x80_0000 != 0 {
                (false, packed - 0x80_0000)
            } else {
                (true, 0x80_0000 - packed)
            };
            let micros = read_fractional_seconds(buf, metadata)?;
            ColumnValue::Time {
                negative,
                hours: (value >> 12) & 0x3FF,
                minutes: ((value >> 6) & 0x3F) as u8,
                seconds: (value & 0x3F) as u8,
                micros,
            }
        }
        ColumnType::DateTime => {
            need(buf, 8)?;
            let packed = buf.get_u64_le();
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            ColumnValue::DateTime {
                year: (date / 10_000) as u16,
                month: ((date / 100) % 100) as u8,
                day: (date % 100) as u8,
                hour: (time / 10_000) as u8,
                minute: ((time / 100) % 100) as u8,
                second: (time % 100) as u8,
                micros: 0,
            }
        }
        ColumnType::DateTime2 => {
            need(buf, 5)?;
            let packed = buf.get_uint(5);
            let year_month = ((packed >> 22) & 0x1_FFFF) as u32;
            let micros = read_fractional_seconds(buf, metadata)?;
            ColumnValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                micros,
            }
        }
        ColumnType::Timestamp => {
            need(buf, 4)?;
            epoch_to_datetime(buf.get_u32_le() as i64, 0)
        }
        ColumnType::Timestamp2 => {
            need(buf, 4)?;
            let secs = buf.get_u32() as i64;
            let micros = read_fractional_seconds(buf, metadata)?;
            epoch_to_datetime(secs, micros)
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                need(buf, 1)?;
                buf.get_u8() as usize
            } else {
                need(buf, 2)?;
                buf.get_u16_le() as usize
            };
            need(buf, len)?;
            text_or_bytes(buf.split_to(len).to_vec())
        }
        ColumnType::String => decode_string_column(buf, metadata)?,
        ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Blob => {
            let raw = take_length_prefixed(buf, metadata)?;
            text_or_bytes(raw)
        }
        ColumnType::Geometry => ColumnValue::Bytes(take_length_prefixed(buf, metadata)?),
        ColumnType::Json => {
            let raw = take_length_prefixed(buf, metadata)?;
            // Binary JSON is carried opaque; text-protocol servers parse.
            match serde_json::from_slice(&raw) {
                Ok(value) => ColumnValue::Json(value),
                Err(_) => ColumnValue::Bytes(raw),
            }
        }
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            ColumnValue::Decimal(decode_decimal(buf, precision, scale)?)
        }
        ColumnType::Bit => {
            let bits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            let bytes = bits.div_ceil(8).max(1);
            need(buf, bytes)?;
            ColumnValue::Bit(buf.split_to(bytes).to_vec())
        }
        ColumnType::Enum => ColumnValue::Enum(read_enum_ordinal(buf, metadata & 0xFF)?),
        ColumnType::Set => {
            let width = ((metadata & 0xFF) as usize).clamp(1, 8);
            need(buf, width)?;
            ColumnValue::Set(buf.get_uint_le(width))
        }
        ColumnType::Decimal => {
            return Err(BinlogError::Protocol(
                "legacy pre-5.0 decimal columns are not supported".into(),
            ))
        }
    })
}

/// CHAR and fixed strings share the type byte with enums and sets; the
/// metadata carries the real type.
fn decode_string_column(buf: &mut Bytes, metadata: u16) -> ParseResult<ColumnValue> {
    let (real_type, length) = string_column_meta(metadata);
    match ColumnType::from_u8(real_type)? {
        ColumnType::Enum => Ok(ColumnValue::Enum(read_enum_ordinal(buf, length as u16)?)),
        ColumnType::Set => {
            let width = length.clamp(1, 8);
            need(buf, width)?;
            Ok(ColumnValue::Set(buf.get_uint_le(width)))
        }
        _ => {
            let len = if length > 255 {
                need(buf, 2)?;
                buf.get_u16_le() as usize
            } else {
                need(buf, 1)?;
                buf.get_u8() as usize
            };
            need(buf, len)?;
            Ok(text_or_bytes(buf.split_to(len).to_vec()))
        }
    }
}

/// Byte lengths over 255 borrow two bits from the type byte.
fn string_column_meta(metadata: u16) -> (u8, usize) {
    let b0 = (metadata >> 8) as u8;
    let b1 = (metadata & 0xFF) as u8;
    if b0 & 0x30 != 0x30 {
        (
            b0 | 0x30,
            (b1 as usize) | ((((b0 & 0x30) ^ 0x30) as usize) << 4),
        )
    } else {
        (b0, b1 as usize)
    }
}

fn read_enum_ordinal(buf: &mut Bytes, width: u16) -> ParseResult<u16> {
    if width == 1 {
        need(buf, 1)?;
        Ok(buf.get_u8() as u16)
    } else {
        need(buf, 2)?;
        Ok(buf.get_u16_le())
    }
}

fn take_length_prefixed(buf: &mut Bytes, metadata: u16) -> ParseResult<Vec<u8>> {
    let len_width = (metadata as usize).clamp(1, 8);
    need(buf, len_width)?;
    let len = buf.get_uint_le(len_width) as usize;
    need(buf, len)?;
    Ok(buf.split_to(len).to_vec())
}

fn text_or_bytes(raw: Vec<u8>) -> ColumnValue {
    match String::from_utf8(raw) {
        Ok(text) => ColumnValue::Text(text),
        Err(err) => ColumnValue::Bytes(err.into_bytes()),
    }
}

fn epoch_to_datetime(secs: i64, micros: u32) -> ColumnValue {
    let at = DateTime::from_timestamp(secs, micros * 1000).unwrap_or_default();
    ColumnValue::DateTime {
        year: at.year() as u16,
        month: at.month() as u8,
        day: at.day() as u8,
        hour: at.hour() as u8,
        minute: at.minute() as u8,
        second: at.second() as u8,
        micros,
    }
}

/// Fractional seconds for the v2 temporal types: `(fsp + 1) / 2` bytes,
/// big endian, in units of `10^-(2 * bytes)` seconds.
fn read_fractional_seconds(buf: &mut Bytes, fsp: u16) -> ParseResult<u32> {
    let bytes = (fsp.min(6) as usize + 1) / 2;
    if bytes == 0 {
        return Ok(0);
    }
    need(buf, bytes)?;
    let raw = buf.get_uint(bytes) as u32;
    Ok(raw.saturating_mul(10u32.pow(6 - 2 * bytes as u32)).min(999_999))
}

/// `DECIMAL(precision, scale)`: groups of nine digits per four-byte big
/// endian word, partial groups in the fewest bytes that fit, sign bit
/// stored inverted in the first byte and negative values complemented.
fn decode_decimal(buf: &mut Bytes, precision: usize, scale: usize) -> ParseResult<String> {
    const DIGITS_PER_WORD: usize = 9;
    const WORD_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    if precision == 0 || precision > 65 || scale > precision {
        return Err(BinlogError::Protocol(format!(
            "invalid decimal precision {precision}, scale {scale}"
        )));
    }

    let integral = precision - scale;
    let int_words = integral / DIGITS_PER_WORD;
    let int_leftover = integral % DIGITS_PER_WORD;
    let frac_words = scale / DIGITS_PER_WORD;
    let frac_leftover = scale % DIGITS_PER_WORD;

    let total =
        int_words * 4 + WORD_BYTES[int_leftover] + frac_words * 4 + WORD_BYTES[frac_leftover];
    need(buf, total)?;
    let mut raw = vec![0u8; total];
    buf.copy_to_slice(&mut raw);

    let negative = raw[0] & 0x80 == 0;
    raw[0] ^= 0x80;
    if negative {
        for byte in raw.iter_mut() {
            *byte = !*byte;
        }
    }

    let mut pos = 0;
    let mut int_digits = String::new();
    if WORD_BYTES[int_leftover] > 0 {
        let word = read_word(&raw, &mut pos, WORD_BYTES[int_leftover]);
        int_digits.push_str(&word.to_string());
    }
    for _ in 0..int_words {
        let word = read_word(&raw, &mut pos, 4);
        if int_digits.is_empty() {
            int_digits.push_str(&word.to_string());
        } else {
            int_digits.push_str(&format!("{word:09}"));
        }
    }
    let int_part = int_digits.trim_start_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };

    let mut frac_digits = String::new();
    for _ in 0..frac_words {
        let word = read_word(&raw, &mut pos, 4);
        frac_digits.push_str(&format!("{word:09}"));
    }
    if WORD_BYTES[frac_leftover] > 0 {
        let word = read_word(&raw, &mut pos, WORD_BYTES[frac_leftover]);
        frac_digits.push_str(&format!("{word:0width$}", width = frac_leftover));
    }

    let sign = if negative { "-" } else { "" };
    if frac_digits.is_empty() {
        Ok(format!("{sign}{int_part}"))
    } else {
        Ok(format!("{sign}{int_part}.{frac_digits}"))
    }
}

fn read_word(raw: &[u8], pos: &mut usize, bytes: usize) -> u32 {
    let mut value = 0u32;
    for _ in 0..bytes {
        value = (value << 8) | raw[*pos] as u32;
        *pos += 1;
    }
    value
}

/// Length-encoded integer as used for counts inside events.
fn read_packed_int(buf: &mut Bytes) -> ParseResult<u64> {
    need(buf, 1)?;
    match buf.get_u8() {
        value @ 0..=250 => Ok(value as u64),
        252 => {
            need(buf, 2)?;
            Ok(buf.get_u16_le() as u64)
        }
        253 => {
            need(buf, 3)?;
            Ok(buf.get_uint_le(3))
        }
        254 => {
            need(buf, 8)?;
            Ok(buf.get_u64_le())
        }
        other => Err(BinlogError::Protocol(format!(
            "invalid length-encoded integer prefix {other}"
        ))),
    }
}

fn read_table_id(buf: &mut Bytes) -> ParseResult<u64> {
    need(buf, 6)?;
    Ok(buf.get_uint_le(6))
}

fn is_bit_set(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / 8)
        .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn need(buf: &Bytes, bytes: usize) -> ParseResult<()> {
    if buf.remaining() < bytes {
        return Err(BinlogError::NotEnoughData);
    }
    Ok(())
}
