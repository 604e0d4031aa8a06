//! PostgreSQL-backed record store.
//!
//! Persists audit records to a (usually separate) PostgreSQL database via
//! `tokio-postgres`. The audit table is provisioned lazily before the first
//! write; the connection is (re)established on demand so the store survives
//! `close` / restart cycles.

use crate::common::{AuditStreamError, ChangeEvent, Result, Validator};
use crate::store::{AuditRecord, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tracing::{debug, error, warn};

const DEFAULT_TABLE: &str = "audit_records";

/// Columns written per record, in insert order.
const INSERT_COLUMNS: usize = 13;

/// [`RecordStore`] backed by a PostgreSQL audit database.
pub struct PostgresRecordStore {
    url: String,
    table_name: String,
    client: Mutex<Option<Arc<tokio_postgres::Client>>>,
    ready: AtomicBool,
}

impl PostgresRecordStore {
    /// Store writing to the default `audit_records` table.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table_name: DEFAULT_TABLE.to_string(),
            client: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Store writing to a custom table. The name must be a plain SQL
    /// identifier; it is interpolated into DDL and insert statements.
    pub fn with_table(url: impl Into<String>, table_name: impl Into<String>) -> Result<Self> {
        let table_name = table_name.into();
        Validator::validate_identifier(&table_name)?;
        Ok(Self {
            url: url.into(),
            table_name,
            client: Mutex::new(None),
            ready: AtomicBool::new(false),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Reuse the live connection or establish a fresh one.
    async fn client(&self) -> Result<Arc<tokio_postgres::Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }

        let (client, connection) = tokio_postgres::connect(&self.url, tokio_postgres::NoTls)
            .await
            .map_err(|e| {
                AuditStreamError::persistence(format!("audit database connection failed: {}", e))
            })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("audit database connection error: {}", e);
            }
        });

        let client = Arc::new(client);
        *guard = Some(client.clone());
        debug!("connected to audit database");
        Ok(client)
    }
}

/// Audit table DDL. The CHECK constraint mirrors the action/image invariant
/// enforced at event construction, so a bypassing writer cannot store an
/// inconsistent row.
fn ddl(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            table_name TEXT NOT NULL,
            schema_name TEXT NOT NULL,
            record_id JSONB NOT NULL DEFAULT '{{}}',
            action TEXT NOT NULL,
            old_data JSONB,
            new_data JSONB,
            changes JSONB NOT NULL DEFAULT '{{}}',
            user_id TEXT,
            user_type TEXT,
            transaction_id TEXT,
            sequence_number BIGINT,
            occurred_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            metadata JSONB NOT NULL DEFAULT '{{}}',
            CONSTRAINT audit_action_images CHECK (
                (action = 'INSERT' AND old_data IS NULL AND new_data IS NOT NULL) OR
                (action = 'UPDATE' AND old_data IS NOT NULL AND new_data IS NOT NULL) OR
                (action = 'DELETE' AND old_data IS NOT NULL AND new_data IS NULL)
            )
        )
        "#,
        table
    )
}

/// Multi-row insert statement for `rows` records.
fn insert_sql(table: &str, rows: usize) -> String {
    let mut groups = Vec::with_capacity(rows);
    for row in 0..rows {
        let base = row * INSERT_COLUMNS;
        let placeholders: Vec<String> = (1..=INSERT_COLUMNS)
            .map(|col| format!("${}", base + col))
            .collect();
        groups.push(format!("({})", placeholders.join(", ")));
    }
    format!(
        "INSERT INTO {} (table_name, schema_name, record_id, action, old_data, new_data, \
         changes, user_id, user_type, transaction_id, sequence_number, occurred_at, metadata) \
         VALUES {} RETURNING id, created_at",
        table,
        groups.join(", ")
    )
}

/// Owned parameter values for one record; JSONB columns need `Value`, not the
/// raw map, to satisfy `ToSql`.
struct RowValues {
    record_id: Value,
    action: String,
    old_data: Option<Value>,
    new_data: Option<Value>,
    changes: Value,
    metadata: Value,
}

impl RowValues {
    fn from_record(record: &AuditRecord) -> Self {
        Self {
            record_id: Value::Object(record.record_id.clone()),
            action: record.action.to_string(),
            old_data: record.old_data.clone().map(Value::Object),
            new_data: record.new_data.clone().map(Value::Object),
            changes: Value::Object(record.changes.clone()),
            metadata: Value::Object(record.metadata.clone()),
        }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn persist(&self, event: &ChangeEvent) -> Result<AuditRecord> {
        let records = self.persist_batch(std::slice::from_ref(event)).await?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| AuditStreamError::persistence("insert returned no row"))
    }

    async fn persist_batch(&self, events: &[ChangeEvent]) -> Result<Vec<AuditRecord>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_ready().await?;
        let client = self.client().await?;

        let mut records: Vec<AuditRecord> = events.iter().map(AuditRecord::from_event).collect();
        let values: Vec<RowValues> = records.iter().map(RowValues::from_record).collect();

        let mut params: Vec<&(dyn ToSql + Sync)> =
            Vec::with_capacity(records.len() * INSERT_COLUMNS);
        for (record, value) in records.iter().zip(&values) {
            params.push(&record.table_name);
            params.push(&record.schema_name);
            params.push(&value.record_id);
            params.push(&value.action);
            params.push(&value.old_data);
            params.push(&value.new_data);
            params.push(&value.changes);
            params.push(&record.user_id);
            params.push(&record.user_type);
            params.push(&record.transaction_id);
            params.push(&record.sequence_number);
            params.push(&record.occurred_at);
            params.push(&value.metadata);
        }

        let sql = insert_sql(&self.table_name, records.len());
        let rows = client.query(&sql, &params).await.map_err(|e| {
            AuditStreamError::persistence(format!("audit insert failed: {}", e))
        })?;
        if rows.len() != records.len() {
            return Err(AuditStreamError::persistence(format!(
                "audit insert returned {} rows for {} records",
                rows.len(),
                records.len()
            )));
        }

        for (record, row) in records.iter_mut().zip(&rows) {
            record.id = row.get::<_, i64>(0);
            record.created_at = row.get::<_, DateTime<Utc>>(1);
        }
        debug!(count = records.len(), table = %self.table_name, "persisted audit records");
        Ok(records)
    }

    async fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let client = self.client().await?;
        client.batch_execute(&ddl(&self.table_name)).await.map_err(|e| {
            AuditStreamError::persistence(format!("audit table provisioning failed: {}", e))
        })?;
        self.ready.store(true, Ordering::SeqCst);
        debug!(table = %self.table_name, "audit table ready");
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        match self.client().await {
            Ok(client) => match client.simple_query("SELECT 1").await {
                Ok(_) => true,
                Err(e) => {
                    warn!("audit store probe failed: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("audit store unreachable: {}", e);
                false
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            debug!("closed audit database connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_contains_action_image_constraint() {
        let sql = ddl("audit_records");
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS audit_records"));
        assert!(sql.contains("CONSTRAINT audit_action_images CHECK"));
        assert!(sql.contains("action = 'INSERT' AND old_data IS NULL AND new_data IS NOT NULL"));
        assert!(sql.contains("action = 'UPDATE' AND old_data IS NOT NULL AND new_data IS NOT NULL"));
        assert!(sql.contains("action = 'DELETE' AND old_data IS NOT NULL AND new_data IS NULL"));
    }

    #[test]
    fn test_insert_sql_single_row() {
        let sql = insert_sql("audit_records", 1);
        assert!(sql.starts_with("INSERT INTO audit_records"));
        assert!(sql.contains("($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"));
        assert!(sql.ends_with("RETURNING id, created_at"));
    }

    #[test]
    fn test_insert_sql_batch_numbers_placeholders() {
        let sql = insert_sql("audit_records", 3);
        // Second row starts at $14, third at $27
        assert!(sql.contains("($14, "));
        assert!(sql.contains("($27, "));
        assert!(sql.contains("$39)"));
        assert!(!sql.contains("$40"));
    }

    #[test]
    fn test_with_table_rejects_injection() {
        assert!(PostgresRecordStore::with_table("postgres://localhost", "audit; DROP TABLE x")
            .is_err());
        assert!(PostgresRecordStore::with_table("postgres://localhost", "audit_log").is_ok());
    }
}
