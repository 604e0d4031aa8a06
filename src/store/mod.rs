//! Audit record persistence.
//!
//! A [`RecordStore`] receives filtered [`ChangeEvent`]s from the service and
//! writes them as audit rows. The store owns its connection and its table; the
//! capture side never touches the audit schema directly.
//!
//! Two implementations ship:
//!
//! | Store | Use case |
//! |-------|----------|
//! | [`PostgresRecordStore`] | Production audit database |
//! | [`MemoryRecordStore`] | Tests, spy assertions, ephemeral capture |

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRecordStore;

use crate::common::{Action, ChangeEvent, ColumnMap, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted audit row: a [`ChangeEvent`] flattened to the audit table's
/// wire shape plus the store-assigned `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Store-assigned identifier
    pub id: i64,
    pub table_name: String,
    pub schema_name: String,
    /// Primary key fields of the changed row
    pub record_id: ColumnMap,
    pub action: Action,
    pub old_data: Option<ColumnMap>,
    pub new_data: Option<ColumnMap>,
    /// Column -> `[old, new]` pairs for UPDATEs
    pub changes: ColumnMap,
    pub user_id: Option<String>,
    pub user_type: Option<String>,
    pub transaction_id: Option<String>,
    pub sequence_number: Option<i64>,
    /// When the change occurred at the source
    pub occurred_at: DateTime<Utc>,
    /// When the store accepted the record
    pub created_at: DateTime<Utc>,
    pub metadata: ColumnMap,
}

impl AuditRecord {
    /// Flatten an event to the wire shape. `id` and `created_at` are
    /// placeholders until the store assigns them.
    pub(crate) fn from_event(event: &ChangeEvent) -> Self {
        let meta = event.adapter_metadata();
        let string_meta = |key: &str| {
            meta.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        Self {
            id: 0,
            table_name: event.table_name().to_string(),
            schema_name: event.schema_name().to_string(),
            record_id: event.primary_key().clone(),
            action: event.action(),
            old_data: event.before_image().cloned(),
            new_data: event.after_image().cloned(),
            changes: event.changes(),
            user_id: string_meta("user_id"),
            user_type: string_meta("user_type"),
            transaction_id: event.transaction_id().map(|s| s.to_string()),
            sequence_number: event.sequence_number(),
            occurred_at: event.timestamp(),
            created_at: Utc::now(),
            metadata: meta.clone(),
        }
    }
}

/// Persists change events as audit records.
///
/// Implementations must tolerate `ensure_ready` being called more than once
/// and `close` being called on an already-closed store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write one event, returning the stored record with its assigned id.
    async fn persist(&self, event: &ChangeEvent) -> Result<AuditRecord>;

    /// Write a batch in one round trip. Empty input returns empty output
    /// without touching the connection.
    async fn persist_batch(&self, events: &[ChangeEvent]) -> Result<Vec<AuditRecord>>;

    /// Idempotently provision the audit table.
    async fn ensure_ready(&self) -> Result<()>;

    /// Lightweight connectivity probe. Never errors; failures are logged.
    async fn test_connection(&self) -> bool;

    /// Release the connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> ColumnMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_from_event_flattens_insert() {
        let event = ChangeEvent::insert(
            "public",
            "users",
            map(&[("id", json!(1)), ("name", json!("Alice"))]),
        )
        .unwrap();

        let record = AuditRecord::from_event(&event);
        assert_eq!(record.table_name, "users");
        assert_eq!(record.schema_name, "public");
        assert_eq!(record.action, Action::Insert);
        assert!(record.old_data.is_none());
        assert_eq!(
            record.new_data.as_ref().and_then(|m| m.get("name")),
            Some(&json!("Alice"))
        );
        assert!(record.changes.is_empty());
    }

    #[test]
    fn test_from_event_carries_changes_for_update() {
        let event = ChangeEvent::update(
            "public",
            "users",
            map(&[("id", json!(1)), ("name", json!("Ken"))]),
            map(&[("id", json!(1)), ("name", json!("Sophia"))]),
        )
        .unwrap();

        let record = AuditRecord::from_event(&event);
        assert_eq!(record.action, Action::Update);
        assert_eq!(
            record.changes.get("name"),
            Some(&json!(["Ken", "Sophia"]))
        );
    }

    #[test]
    fn test_from_event_lifts_user_metadata() {
        let event = ChangeEvent::builder()
            .table_name("orders")
            .action(Action::Delete)
            .before_image(map(&[("id", json!(7))]))
            .adapter_metadata(map(&[
                ("user_id", json!("svc-batch")),
                ("user_type", json!("service")),
                ("source", json!("postgres")),
            ]))
            .build()
            .unwrap();

        let record = AuditRecord::from_event(&event);
        assert_eq!(record.user_id.as_deref(), Some("svc-batch"));
        assert_eq!(record.user_type.as_deref(), Some("service"));
        // Non-string metadata values never populate the user columns
        assert_eq!(record.metadata.get("source"), Some(&json!("postgres")));
    }

    #[test]
    fn test_from_event_without_user_metadata() {
        let event = ChangeEvent::insert("public", "t", map(&[("id", json!(1))])).unwrap();
        let record = AuditRecord::from_event(&event);
        assert!(record.user_id.is_none());
        assert!(record.user_type.is_none());
    }
}
