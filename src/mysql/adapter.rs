//! MySQL/MariaDB streaming adapter
//!
//! Runs one raw binlog dump connection per streaming session plus
//! short-lived `mysql_async` connections for catalog queries, so slow
//! catalog lookups never stall the dump. Row events are buffered per
//! transaction and only reach the sink once the Xid record arrives.

use crate::common::{
    Action, AdapterKind, AuditStreamError, ChangeEvent, ColumnMap, EventSink, Position, Result,
    StreamAdapter, Validator,
};
use crate::mysql::client::BinlogClient;
use crate::mysql::decoder::{
    BinlogDecoder, BinlogEvent, ColumnValue, RowImage, RowsEvent, TableMapEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mysql_async::prelude::Queryable;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, trace, warn};

const DEFAULT_PORT: u16 = 3306;
const DEFAULT_SERVER_ID: u32 = 1001;
const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(10);
/// First event offset after the 4-byte binlog file magic.
const BINLOG_START_OFFSET: u64 = 4;
/// Upper bound on cached per-table column lookups.
const COLUMN_CACHE_LIMIT: usize = 1024;

/// Settings for [`MysqlAdapter`].
///
/// Starts from [`MysqlAdapterConfig::new`] with localhost defaults and is
/// refined through the `with_*` methods.
#[derive(Clone)]
pub struct MysqlAdapterConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    /// Restricts capture to one schema when set; all schemas otherwise.
    pub database: Option<String>,
    /// Replica identity announced to the source. Must differ from the
    /// source's own `server_id` and from every other replica's.
    pub server_id: u32,
    /// Explicit resume file; the source's current position is used when
    /// unset.
    pub binlog_file: Option<String>,
    pub binlog_offset: u64,
    /// Requested heartbeat period, keeps idle dumps from timing out.
    pub status_interval: Duration,
}

impl Default for MysqlAdapterConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            username: "root".to_string(),
            password: None,
            database: None,
            server_id: DEFAULT_SERVER_ID,
            binlog_file: None,
            binlog_offset: BINLOG_START_OFFSET,
            status_interval: DEFAULT_STATUS_INTERVAL,
        }
    }
}

impl MysqlAdapterConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Resume from an explicit binlog position instead of the source's
    /// current one.
    pub fn with_binlog_position(mut self, file: impl Into<String>, offset: u64) -> Self {
        self.binlog_file = Some(file.into());
        self.binlog_offset = offset;
        self
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Rejects settings the replication commands cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(AuditStreamError::configuration("host cannot be empty"));
        }
        if self.username.is_empty() {
            return Err(AuditStreamError::configuration("username cannot be empty"));
        }
        if let Some(database) = &self.database {
            Validator::validate_identifier(database)?;
        }
        if self.server_id == 0 {
            // Zero marks an anonymous client and the server rejects it.
            return Err(AuditStreamError::configuration(
                "server_id must be non-zero",
            ));
        }
        if self.binlog_offset < BINLOG_START_OFFSET {
            return Err(AuditStreamError::configuration(format!(
                "binlog offset {} falls inside the file magic; the first event is at {}",
                self.binlog_offset, BINLOG_START_OFFSET
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MysqlAdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MysqlAdapterConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("database", &self.database)
            .field("server_id", &self.server_id)
            .field("binlog_file", &self.binlog_file)
            .field("binlog_offset", &self.binlog_offset)
            .field("status_interval", &self.status_interval)
            .finish()
    }
}

/// Column names for one table, in binlog image order.
#[derive(Clone)]
struct TableColumns {
    names: Vec<String>,
    key: Vec<String>,
}

/// FIFO-bounded cache of catalog lookups keyed by `schema.table`.
struct ColumnNameCache {
    entries: HashMap<String, TableColumns>,
    order: VecDeque<String>,
}

impl ColumnNameCache {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&TableColumns> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, columns: TableColumns) {
        if self.entries.insert(key.clone(), columns).is_none() {
            self.order.push_back(key);
            if self.order.len() > COLUMN_CACHE_LIMIT {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

/// Change capture from the MySQL binary log.
///
/// `setup` verifies the source is replicable (row-capable binlog format,
/// non-colliding server id); `start_streaming` registers as a replica,
/// requests a dump and feeds decoded row events through a per-transaction
/// buffer into the sink.
pub struct MysqlAdapter {
    config: MysqlAdapterConfig,
    streaming: AtomicBool,
    stop: Notify,
    /// Last committed position, `(file, offset)`.
    position: Mutex<Option<(String, u64)>>,
    columns: Mutex<ColumnNameCache>,
}

impl MysqlAdapter {
    pub fn new(config: MysqlAdapterConfig) -> Self {
        Self {
            config,
            streaming: AtomicBool::new(false),
            stop: Notify::new(),
            position: Mutex::new(None),
            columns: Mutex::new(ColumnNameCache::new()),
        }
    }

    pub fn config(&self) -> &MysqlAdapterConfig {
        &self.config
    }

    /// Opens a short-lived catalog connection. The binlog dump never runs
    /// over these.
    async fn control_conn(&self) -> Result<mysql_async::Conn> {
        let opts = mysql_async::OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.username.clone()))
            .pass(self.config.password.clone())
            .db_name(self.config.database.clone());
        Ok(mysql_async::Conn::new(opts).await?)
    }

    /// Fails fast on source settings replication cannot work with.
    async fn ensure_replication_ready(&self) -> Result<()> {
        let mut conn = self.control_conn().await?;
        let result = check_source_settings(&mut conn, self.config.server_id).await;
        conn.disconnect().await.ok();
        result
    }

    async fn fetch_source_position(&self) -> Result<(String, u64)> {
        let mut conn = self.control_conn().await?;
        let status = source_position(&mut conn).await;
        conn.disconnect().await.ok();
        status
    }

    /// Reads `binlog_checksum` so the decoder can strip CRC32 trailers
    /// from events that arrive before the format description does.
    async fn source_checksum_is_crc32(&self) -> bool {
        let Ok(mut conn) = self.control_conn().await else {
            return false;
        };
        let checksum: Option<String> = conn
            .query_first("SELECT @@global.binlog_checksum")
            .await
            .ok()
            .flatten();
        conn.disconnect().await.ok();
        checksum.as_deref() == Some("CRC32")
    }

    /// Column and primary-key names for a table, cached after the first
    /// catalog round trip.
    async fn table_columns(&self, schema: &str, table: &str) -> Result<TableColumns> {
        let key = format!("{schema}.{table}");
        if let Some(cached) = self.columns.lock().await.get(&key).cloned() {
            return Ok(cached);
        }

        let mut conn = self.control_conn().await?;
        let fetched = fetch_table_columns(&mut conn, schema, table).await;
        conn.disconnect().await.ok();
        let columns = fetched?;

        self.columns.lock().await.insert(key, columns.clone());
        Ok(columns)
    }

    async fn resolve_start_position(&self) -> Result<(String, u64)> {
        if let Some(file) = &self.config.binlog_file {
            return Ok((file.clone(), self.config.binlog_offset));
        }
        if let Some(cached) = self.position.lock().await.clone() {
            return Ok(cached);
        }
        self.fetch_source_position().await
    }

    fn skip_schema(&self, schema: &str) -> bool {
        match &self.config.database {
            Some(database) => !schema.eq_ignore_ascii_case(database),
            None => false,
        }
    }

    async fn run_stream(&self, sink: &EventSink) -> Result<()> {
        self.config.validate()?;
        self.ensure_replication_ready().await?;
        let checksum_crc32 = self.source_checksum_is_crc32().await;
        let (mut file, mut offset) = self.resolve_start_position().await?;

        let mut client = BinlogClient::connect(
            &self.config.host,
            self.config.port,
            &self.config.username,
            self.config.password.as_deref(),
            self.config.database.as_deref(),
        )
        .await
        .map_err(stream_error)?;

        negotiate_session(&mut client, self.config.status_interval).await;
        client
            .register_replica(self.config.server_id)
            .await
            .map_err(stream_error)?;
        let mut stream = client
            .start_dump(
                self.config.server_id,
                &file,
                offset.min(u32::MAX as u64) as u32,
            )
            .await
            .map_err(stream_error)?;

        let mut decoder = BinlogDecoder::new();
        decoder.set_checksum(checksum_crc32);
        let mut txn = TransactionBuffer::new();
        info!(file = %file, offset, "binlog streaming loop entered");

        loop {
            let frame = tokio::select! {
                _ = self.stop.notified() => {
                    info!("stop requested, leaving binlog streaming loop");
                    return Ok(());
                }
                frame = stream.next_event() => frame.map_err(stream_error)?,
            };
            let Some(frame) = frame else {
                info!("source ended the binlog dump");
                return Ok(());
            };

            let (header, event) = match decoder.decode(&frame) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable binlog event");
                    continue;
                }
            };
            if header.next_position > 0 {
                offset = header.next_position as u64;
            }

            match event {
                BinlogEvent::FormatDescription(fde) => {
                    debug!(version = %fde.server_version, checksum = fde.checksum_crc32, "binlog format negotiated");
                }
                BinlogEvent::Rotate(rotate) => {
                    debug!(file = %rotate.next_file, offset = rotate.position, "binlog rotated");
                    file = rotate.next_file;
                    offset = rotate.position;
                }
                BinlogEvent::TableMap(map) => {
                    if self.skip_schema(&map.schema) {
                        continue;
                    }
                    // Warm the name cache here, off the per-row path.
                    if let Err(e) = self.table_columns(&map.schema, &map.table).await {
                        warn!(
                            schema = %map.schema,
                            table = %map.table,
                            error = %e,
                            "column lookup failed, falling back to positional names"
                        );
                    }
                }
                BinlogEvent::Query(query) => {
                    if query.query.eq_ignore_ascii_case("BEGIN") {
                        txn.begin();
                    }
                }
                BinlogEvent::WriteRows(rows) => {
                    self.buffer_rows(&mut txn, &decoder, Action::Insert, rows)
                        .await;
                }
                BinlogEvent::UpdateRows(rows) => {
                    self.buffer_rows(&mut txn, &decoder, Action::Update, rows)
                        .await;
                }
                BinlogEvent::DeleteRows(rows) => {
                    self.buffer_rows(&mut txn, &decoder, Action::Delete, rows)
                        .await;
                }
                BinlogEvent::Xid(xid) => {
                    let committed_at = DateTime::from_timestamp(header.timestamp as i64, 0);
                    let events = txn.commit(xid, committed_at, &file, offset);
                    let count = events.len();
                    for event in events {
                        sink(event).await;
                    }
                    *self.position.lock().await = Some((file.clone(), offset));
                    debug!(xid, events = count, file = %file, offset, "transaction committed");
                }
                BinlogEvent::Gtid(gtid) => {
                    debug!(gtid = %gtid.gtid(), "transaction group started");
                }
                BinlogEvent::Heartbeat => {}
                BinlogEvent::Ignored(event_type) => {
                    trace!(?event_type, "ignoring binlog event");
                }
            }
        }
    }

    async fn buffer_rows(
        &self,
        txn: &mut TransactionBuffer,
        decoder: &BinlogDecoder,
        action: Action,
        rows: RowsEvent,
    ) {
        let Some(table) = decoder.table(rows.table_id) else {
            warn!(table_id = rows.table_id, "rows event without a table map");
            return;
        };
        if self.skip_schema(&table.schema) {
            return;
        }

        let columns = self
            .columns
            .lock()
            .await
            .get(&format!("{}.{}", table.schema, table.table))
            .cloned();
        for row in rows.rows {
            txn.push(assemble_change(table, columns.as_ref(), action, row));
        }
    }
}

#[async_trait]
impl StreamAdapter for MysqlAdapter {
    async fn start_streaming(&self, sink: EventSink) -> Result<()> {
        if self.streaming.swap(true, Ordering::SeqCst) {
            return Err(AuditStreamError::replication(
                "a streaming session is already active",
            ));
        }

        let result = match self.run_stream(&sink).await {
            Ok(()) => Ok(()),
            Err(e @ AuditStreamError::Replication(_)) => Err(e),
            Err(other) => Err(AuditStreamError::replication(format!(
                "streaming session failed: {other}"
            ))),
        };

        self.streaming.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            error!(error = %e, "binlog streaming session ended with error");
        }
        result
    }

    async fn stop_streaming(&self) -> Result<()> {
        if self.streaming.swap(false, Ordering::SeqCst) {
            self.stop.notify_one();
            info!("binlog stream stop requested");
        }
        // The dump connection lives in the streaming task and drops when
        // the loop observes the notification.
        Ok(())
    }

    async fn current_position(&self) -> Result<Option<Position>> {
        if let Some((file, offset)) = self.position.lock().await.clone() {
            return Ok(Some(Position::mysql_binlog(file, offset)));
        }
        let (file, offset) = self.fetch_source_position().await?;
        Ok(Some(Position::mysql_binlog(file, offset)))
    }

    async fn setup(&self) -> Result<()> {
        self.config.validate()?;
        self.ensure_replication_ready().await?;
        info!(
            host = %self.config.host,
            server_id = self.config.server_id,
            "source ready for binlog streaming"
        );
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        // Nothing lives on the server for this replica; it deregisters
        // when the dump connection drops.
        info!("mysql teardown is a no-op");
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        match self.control_conn().await {
            Ok(mut conn) => {
                let ok = conn.query_drop("SELECT 1").await.is_ok();
                conn.disconnect().await.ok();
                ok
            }
            Err(e) => {
                warn!(error = %e, "mysql connection test failed");
                false
            }
        }
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn kind(&self) -> AdapterKind {
        AdapterKind::Mysql
    }
}

/// Session variables the dump refuses to start without. Failures here are
/// logged and left for the dump command to surface properly.
async fn negotiate_session(client: &mut BinlogClient, status_interval: Duration) {
    if client.server_version().contains("MariaDB") {
        // MariaDB requires the checksum variable before the capability one.
        if let Err(e) = client.query("SET @master_binlog_checksum = 'CRC32'").await {
            debug!(error = %e, "checksum negotiation failed");
        }
        if let Err(e) = client.query("SET @mariadb_slave_capability=5").await {
            debug!(error = %e, "capability negotiation failed");
        }
    } else if let Err(e) = client
        .query("SET @master_binlog_checksum = @@global.binlog_checksum")
        .await
    {
        debug!(error = %e, "checksum negotiation failed");
    }

    let nanos = status_interval.as_nanos().min(u64::MAX as u128) as u64;
    if nanos > 0 {
        if let Err(e) = client
            .query(&format!("SET @master_heartbeat_period = {nanos}"))
            .await
        {
            debug!(error = %e, "heartbeat negotiation failed");
        }
    }
}

async fn check_source_settings(conn: &mut mysql_async::Conn, server_id: u32) -> Result<()> {
    let format: Option<String> = conn.query_first("SELECT @@global.binlog_format").await?;
    match format.as_deref() {
        Some("ROW") | Some("MIXED") => {}
        Some(other) => {
            return Err(AuditStreamError::replication(format!(
                "binlog_format must be ROW or MIXED, found {other}"
            )));
        }
        None => {
            return Err(AuditStreamError::replication(
                "source did not report a binlog_format",
            ));
        }
    }

    let source_id: Option<u64> = conn.query_first("SELECT @@global.server_id").await?;
    if source_id == Some(server_id as u64) {
        return Err(AuditStreamError::replication(format!(
            "server_id {server_id} collides with the source's own id"
        )));
    }
    Ok(())
}

/// Current write position, trying the MySQL 8.4 statement first and
/// falling back to the pre-8.4 spelling.
async fn source_position(conn: &mut mysql_async::Conn) -> Result<(String, u64)> {
    let row: Option<mysql_async::Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
        Ok(row) => row,
        Err(_) => conn.query_first("SHOW MASTER STATUS").await?,
    };
    let Some(row) = row else {
        return Err(AuditStreamError::replication(
            "source reported no binlog position; binary logging is likely disabled (log_bin=OFF)",
        ));
    };
    let file: Option<String> = row.get(0);
    let offset: Option<u64> = row.get(1);
    match (file, offset) {
        (Some(file), Some(offset)) if !file.is_empty() => Ok((file, offset)),
        _ => Err(AuditStreamError::replication(
            "source returned an empty binlog position; binary logging is likely disabled",
        )),
    }
}

async fn fetch_table_columns(
    conn: &mut mysql_async::Conn,
    schema: &str,
    table: &str,
) -> Result<TableColumns> {
    let names: Vec<String> = conn
        .exec(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            (schema, table),
        )
        .await?;
    let key: Vec<String> = conn
        .exec(
            "SELECT COLUMN_NAME FROM information_schema.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
             ORDER BY ORDINAL_POSITION",
            (schema, table),
        )
        .await?;
    Ok(TableColumns { names, key })
}

/// One decoded row change waiting for its transaction's Xid.
struct RowChange {
    schema: String,
    table: String,
    action: Action,
    key: ColumnMap,
    before: Option<ColumnMap>,
    after: Option<ColumnMap>,
}

/// Pairs row values with catalog names and projects the primary key from
/// the image the action guarantees to carry.
fn assemble_change(
    table: &TableMapEvent,
    columns: Option<&TableColumns>,
    action: Action,
    row: RowImage,
) -> RowChange {
    let names = columns.map(|c| c.names.as_slice()).unwrap_or(&[]);
    let before = row.before.map(|values| zip_columns(names, &values));
    let after = row.after.map(|values| zip_columns(names, &values));

    let key_names = columns.map(|c| c.key.as_slice()).unwrap_or(&[]);
    let key_source = match action {
        Action::Insert => after.as_ref(),
        Action::Update | Action::Delete => before.as_ref(),
    };
    let key = key_source
        .map(|image| project_key(key_names, image))
        .unwrap_or_default();

    RowChange {
        schema: table.schema.clone(),
        table: table.table.clone(),
        action,
        key,
        before,
        after,
    }
}

/// Positional `col{N}` names stand in when the catalog was unavailable.
fn zip_columns(names: &[String], values: &[ColumnValue]) -> ColumnMap {
    let mut map = ColumnMap::new();
    for (index, value) in values.iter().enumerate() {
        let name = names
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("col{index}"));
        map.insert(name, value.to_json());
    }
    map
}

fn project_key(key_names: &[String], image: &ColumnMap) -> ColumnMap {
    key_names
        .iter()
        .filter_map(|name| image.get(name).map(|value| (name.clone(), value.clone())))
        .collect()
}

/// Buffers row changes between BEGIN and Xid so events only reach the
/// sink once their transaction is durable.
struct TransactionBuffer {
    in_txn: bool,
    changes: Vec<RowChange>,
}

impl TransactionBuffer {
    fn new() -> Self {
        Self {
            in_txn: false,
            changes: Vec::new(),
        }
    }

    fn begin(&mut self) {
        if !self.changes.is_empty() {
            warn!(
                dropped = self.changes.len(),
                "begin arrived with uncommitted changes buffered"
            );
        }
        self.in_txn = true;
        self.changes.clear();
    }

    fn push(&mut self, change: RowChange) {
        if !self.in_txn {
            warn!(table = %change.table, "row change outside a transaction, dropping");
            return;
        }
        self.changes.push(change);
    }

    /// Drains the buffer into ordered events stamped with the xid, the
    /// commit timestamp and the binlog position of the commit.
    fn commit(
        &mut self,
        xid: u64,
        committed_at: Option<DateTime<Utc>>,
        file: &str,
        offset: u64,
    ) -> Vec<ChangeEvent> {
        self.in_txn = false;
        let changes = std::mem::take(&mut self.changes);
        let position = Position::mysql_binlog(file, offset).to_string();

        changes
            .into_iter()
            .enumerate()
            .filter_map(|(index, change)| {
                let mut builder = ChangeEvent::builder()
                    .schema_name(change.schema)
                    .table_name(change.table)
                    .action(change.action)
                    .primary_key(change.key)
                    .transaction_id(xid.to_string())
                    .sequence_number(index as i64 + 1)
                    .metadata_entry("position", json!(position.clone()));
                if let Some(at) = committed_at {
                    builder = builder.timestamp(at);
                }
                if let Some(before) = change.before {
                    builder = builder.before_image(before);
                }
                if let Some(after) = change.after {
                    builder = builder.after_image(after);
                }
                match builder.build() {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "dropping change that failed event validation");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Streaming failures cross from the anyhow-based wire client into the
/// crate error type here.
fn stream_error(error: anyhow::Error) -> AuditStreamError {
    AuditStreamError::replication(format!("{error:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::sink_fn;

    fn users_map() -> TableMapEvent {
        TableMapEvent {
            table_id: 42,
            schema: "app".to_string(),
            table: "users".to_string(),
            column_types: Vec::new(),
            column_metadata: Vec::new(),
        }
    }

    fn users_columns() -> TableColumns {
        TableColumns {
            names: vec!["id".to_string(), "email".to_string()],
            key: vec!["id".to_string()],
        }
    }

    fn insert_row(id: i64, email: &str) -> RowImage {
        RowImage {
            before: None,
            after: Some(vec![
                ColumnValue::SignedInt(id),
                ColumnValue::Text(email.to_string()),
            ]),
        }
    }

    fn delete_row(id: i64, email: &str) -> RowImage {
        RowImage {
            before: Some(vec![
                ColumnValue::SignedInt(id),
                ColumnValue::Text(email.to_string()),
            ]),
            after: None,
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = MysqlAdapterConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 3306);
        assert_eq!(config.username, "root");
        assert_eq!(config.server_id, 1001);
        assert_eq!(config.binlog_offset, 4);
        assert!(config.password.is_none());
        assert!(config.binlog_file.is_none());
    }

    #[test]
    fn test_config_builder_chain() {
        let config = MysqlAdapterConfig::new("db.internal", "repl")
            .with_port(3307)
            .with_password("s3cret")
            .with_database("app")
            .with_server_id(7)
            .with_binlog_position("mysql-bin.000009", 120)
            .with_status_interval(Duration::from_secs(5));

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 3307);
        assert_eq!(config.username, "repl");
        assert_eq!(config.password.as_deref(), Some("s3cret"));
        assert_eq!(config.database.as_deref(), Some("app"));
        assert_eq!(config.server_id, 7);
        assert_eq!(config.binlog_file.as_deref(), Some("mysql-bin.000009"));
        assert_eq!(config.binlog_offset, 120);
        assert_eq!(config.status_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = MysqlAdapterConfig::default().with_password("hunter2");
        let rendered = format!("{config:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_config_validation() {
        assert!(MysqlAdapterConfig::default().validate().is_ok());
        assert!(MysqlAdapterConfig::new("", "root").validate().is_err());
        assert!(MysqlAdapterConfig::new("localhost", "")
            .validate()
            .is_err());
        assert!(MysqlAdapterConfig::default()
            .with_server_id(0)
            .validate()
            .is_err());
        assert!(MysqlAdapterConfig::default()
            .with_binlog_position("mysql-bin.000001", 2)
            .validate()
            .is_err());
        assert!(MysqlAdapterConfig::default()
            .with_database("bad-name")
            .validate()
            .is_err());
    }

    #[test]
    fn test_assemble_insert_keys_from_after_image() {
        let map = users_map();
        let columns = users_columns();
        let change = assemble_change(&map, Some(&columns), Action::Insert, insert_row(9, "a@b.c"));

        assert_eq!(change.schema, "app");
        assert_eq!(change.table, "users");
        assert!(change.before.is_none());
        let after = change.after.as_ref().unwrap();
        assert_eq!(after["id"], json!(9));
        assert_eq!(after["email"], json!("a@b.c"));
        assert_eq!(change.key["id"], json!(9));
        assert_eq!(change.key.len(), 1);
    }

    #[test]
    fn test_assemble_delete_keys_from_before_image() {
        let map = users_map();
        let columns = users_columns();
        let change = assemble_change(&map, Some(&columns), Action::Delete, delete_row(3, "x@y.z"));

        assert!(change.after.is_none());
        assert_eq!(change.key["id"], json!(3));
    }

    #[test]
    fn test_zip_columns_falls_back_to_positional_names() {
        let names = vec!["id".to_string()];
        let values = vec![ColumnValue::SignedInt(1), ColumnValue::Text("x".into())];
        let map = zip_columns(&names, &values);

        assert_eq!(map["id"], json!(1));
        assert_eq!(map["col1"], json!("x"));
    }

    #[test]
    fn test_project_key_ignores_missing_columns() {
        let mut image = ColumnMap::new();
        image.insert("id".to_string(), json!(5));
        let keys = vec!["id".to_string(), "tenant".to_string()];
        let key = project_key(&keys, &image);

        assert_eq!(key.len(), 1);
        assert_eq!(key["id"], json!(5));
    }

    #[test]
    fn test_transaction_buffer_assembles_events() {
        let map = users_map();
        let columns = users_columns();
        let at = DateTime::from_timestamp(1_700_000_000, 0);

        let mut txn = TransactionBuffer::new();
        txn.begin();
        txn.push(assemble_change(
            &map,
            Some(&columns),
            Action::Insert,
            insert_row(1, "a@b.c"),
        ));
        txn.push(assemble_change(
            &map,
            Some(&columns),
            Action::Delete,
            delete_row(2, "x@y.z"),
        ));
        let events = txn.commit(801, at, "mysql-bin.000003", 4242);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].transaction_id(), Some("801"));
        assert_eq!(events[0].sequence_number(), Some(1));
        assert_eq!(events[1].sequence_number(), Some(2));
        assert_eq!(events[0].timestamp(), at.unwrap());
        assert_eq!(
            events[0].adapter_metadata()["position"],
            json!("mysql-bin.000003:4242")
        );
        assert_eq!(events[0].action(), Action::Insert);
        assert_eq!(events[1].action(), Action::Delete);
        assert_eq!(events[0].schema_name(), "app");
    }

    #[test]
    fn test_transaction_buffer_drops_changes_outside_transaction() {
        let map = users_map();
        let mut txn = TransactionBuffer::new();
        txn.push(assemble_change(
            &map,
            None,
            Action::Insert,
            insert_row(1, "a@b.c"),
        ));
        assert!(txn.commit(1, None, "mysql-bin.000001", 4).is_empty());
    }

    #[test]
    fn test_transaction_buffer_skips_invalid_change() {
        let map = users_map();
        let mut txn = TransactionBuffer::new();
        txn.begin();
        // Insert without an after image fails event validation.
        txn.push(RowChange {
            schema: "app".to_string(),
            table: "users".to_string(),
            action: Action::Insert,
            key: ColumnMap::new(),
            before: None,
            after: Some(ColumnMap::new()),
        });
        txn.push(assemble_change(
            &map,
            None,
            Action::Insert,
            insert_row(3, "c@d.e"),
        ));
        let events = txn.commit(5, None, "mysql-bin.000001", 900);

        assert_eq!(events.len(), 1);
        // Sequence numbers keep their position within the transaction.
        assert_eq!(events[0].sequence_number(), Some(2));
    }

    #[test]
    fn test_begin_discards_stale_changes() {
        let map = users_map();
        let mut txn = TransactionBuffer::new();
        txn.begin();
        txn.push(assemble_change(
            &map,
            None,
            Action::Insert,
            insert_row(1, "a@b.c"),
        ));
        txn.begin();
        assert!(txn.commit(9, None, "mysql-bin.000001", 4).is_empty());
    }

    #[test]
    fn test_column_cache_evicts_oldest() {
        let mut cache = ColumnNameCache::new();
        for i in 0..=COLUMN_CACHE_LIMIT {
            cache.insert(
                format!("app.t{i}"),
                TableColumns {
                    names: Vec::new(),
                    key: Vec::new(),
                },
            );
        }
        assert!(cache.get("app.t0").is_none());
        assert!(cache.get(&format!("app.t{COLUMN_CACHE_LIMIT}")).is_some());
    }

    #[test]
    fn test_skip_schema_honors_database_filter() {
        let filtered = MysqlAdapter::new(MysqlAdapterConfig::default().with_database("app"));
        assert!(!filtered.skip_schema("app"));
        assert!(!filtered.skip_schema("APP"));
        assert!(filtered.skip_schema("other"));

        let open = MysqlAdapter::new(MysqlAdapterConfig::default());
        assert!(!open.skip_schema("anything"));
    }

    #[tokio::test]
    async fn test_second_session_is_rejected() {
        let adapter = MysqlAdapter::new(MysqlAdapterConfig::default());
        adapter.streaming.store(true, Ordering::SeqCst);
        let sink = sink_fn(|_| async {});
        let err = adapter.start_streaming(sink).await.unwrap_err();
        assert!(err.to_string().contains("already active"));
        assert!(adapter.is_streaming());
    }

    #[tokio::test]
    async fn test_stop_streaming_is_idempotent() {
        let adapter = MysqlAdapter::new(MysqlAdapterConfig::default());
        assert!(adapter.stop_streaming().await.is_ok());
        assert!(adapter.stop_streaming().await.is_ok());
        assert!(!adapter.is_streaming());
        assert_eq!(adapter.kind(), AdapterKind::Mysql);
    }
}
