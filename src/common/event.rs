//! Change event representation
//!
//! Unified event structure for all capture sources (PostgreSQL, MySQL,
//! MariaDB). An event is the normalized form of one row mutation and is
//! validated at construction time:
//!
//! - INSERT carries an after-image and no before-image
//! - UPDATE carries both images
//! - DELETE carries a before-image and no after-image
//!
//! Events are immutable once built. The diff helpers ([`ChangeEvent::changed_columns`],
//! [`ChangeEvent::changes`]) are computed on demand and never stored.

use crate::common::error::{AuditStreamError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Column name to JSON value mapping used for row images and key fields.
pub type ColumnMap = serde_json::Map<String, Value>;

/// Row mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert => write!(f, "INSERT"),
            Action::Update => write!(f, "UPDATE"),
            Action::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for Action {
    type Err = AuditStreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Action::Insert),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            _ => Err(AuditStreamError::validation("invalid action")),
        }
    }
}

/// One captured row change, normalized across sources.
///
/// Constructed by a streaming adapter once per decoded change, either through
/// [`ChangeEvent::builder`] or the [`ChangeEvent::insert`] / [`ChangeEvent::update`] /
/// [`ChangeEvent::delete`] shorthands. Fields are private; the value cannot be
/// mutated after construction, so the action/image invariant checked by the
/// builder holds for the lifetime of the event.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ChangeEvent {
    table_name: String,
    schema_name: String,
    action: Action,
    primary_key: ColumnMap,
    before_image: Option<ColumnMap>,
    after_image: Option<ColumnMap>,
    timestamp: DateTime<Utc>,
    transaction_id: Option<String>,
    sequence_number: Option<i64>,
    adapter_metadata: ColumnMap,
}

impl ChangeEvent {
    /// Start building an event. `build()` validates the action/image
    /// combination and fails with a validation error on violation.
    pub fn builder() -> ChangeEventBuilder {
        ChangeEventBuilder::default()
    }

    /// Shorthand for an INSERT event with an after-image.
    pub fn insert(
        schema: impl Into<String>,
        table: impl Into<String>,
        after: ColumnMap,
    ) -> Result<Self> {
        Self::builder()
            .schema_name(schema)
            .table_name(table)
            .action(Action::Insert)
            .after_image(after)
            .build()
    }

    /// Shorthand for an UPDATE event with both images.
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: ColumnMap,
        after: ColumnMap,
    ) -> Result<Self> {
        Self::builder()
            .schema_name(schema)
            .table_name(table)
            .action(Action::Update)
            .before_image(before)
            .after_image(after)
            .build()
    }

    /// Shorthand for a DELETE event with a before-image.
    pub fn delete(
        schema: impl Into<String>,
        table: impl Into<String>,
        before: ColumnMap,
    ) -> Result<Self> {
        Self::builder()
            .schema_name(schema)
            .table_name(table)
            .action(Action::Delete)
            .before_image(before)
            .build()
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    /// `schema.table`, the form used in logs and filter checks.
    pub fn qualified_table_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn primary_key(&self) -> &ColumnMap {
        &self.primary_key
    }

    pub fn before_image(&self) -> Option<&ColumnMap> {
        self.before_image.as_ref()
    }

    pub fn after_image(&self) -> Option<&ColumnMap> {
        self.after_image.as_ref()
    }

    /// When the change occurred at the source. Defaults to capture time when
    /// the source did not supply one.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    pub fn sequence_number(&self) -> Option<i64> {
        self.sequence_number
    }

    /// Adapter-specific extras, e.g. the replication position the change was
    /// decoded at.
    pub fn adapter_metadata(&self) -> &ColumnMap {
        &self.adapter_metadata
    }

    /// Columns present in both images whose values differ. Sorted for
    /// deterministic output. Empty unless the action is UPDATE.
    pub fn changed_columns(&self) -> Vec<String> {
        let (before, after) = match (self.action, &self.before_image, &self.after_image) {
            (Action::Update, Some(before), Some(after)) => (before, after),
            _ => return Vec::new(),
        };

        let mut columns: Vec<String> = before
            .iter()
            .filter(|(name, old)| after.get(name.as_str()).is_some_and(|new| new != *old))
            .map(|(name, _)| name.clone())
            .collect();
        columns.sort();
        columns
    }

    /// Per-column `[old, new]` pairs for every changed column.
    pub fn changes(&self) -> ColumnMap {
        let mut out = ColumnMap::new();
        if let (Some(before), Some(after)) = (&self.before_image, &self.after_image) {
            for column in self.changed_columns() {
                let old = before.get(&column).cloned().unwrap_or(Value::Null);
                let new = after.get(&column).cloned().unwrap_or(Value::Null);
                out.insert(column, Value::Array(vec![old, new]));
            }
        }
        out
    }

    /// The image that reflects the row as of this event: the after-image for
    /// INSERT/UPDATE, the before-image for DELETE.
    pub fn current_image(&self) -> Option<&ColumnMap> {
        match self.action {
            Action::Insert | Action::Update => self.after_image.as_ref(),
            Action::Delete => self.before_image.as_ref(),
        }
    }

    /// Before-image merged with after-image; the after-image wins on
    /// conflicting keys.
    pub fn combined_image(&self) -> ColumnMap {
        let mut combined = self.before_image.clone().unwrap_or_default();
        if let Some(after) = &self.after_image {
            for (name, value) in after {
                combined.insert(name.clone(), value.clone());
            }
        }
        combined
    }
}

/// Builder for [`ChangeEvent`]. `schema_name` defaults to `"public"` and
/// `timestamp` to the time of `build()` when left unset.
#[derive(Debug, Default)]
pub struct ChangeEventBuilder {
    table_name: Option<String>,
    schema_name: Option<String>,
    action: Option<Action>,
    primary_key: ColumnMap,
    before_image: Option<ColumnMap>,
    after_image: Option<ColumnMap>,
    timestamp: Option<DateTime<Utc>>,
    transaction_id: Option<String>,
    sequence_number: Option<i64>,
    adapter_metadata: ColumnMap,
}

impl ChangeEventBuilder {
    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    pub fn schema_name(mut self, schema: impl Into<String>) -> Self {
        self.schema_name = Some(schema.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn primary_key(mut self, key: ColumnMap) -> Self {
        self.primary_key = key;
        self
    }

    pub fn before_image(mut self, image: ColumnMap) -> Self {
        self.before_image = Some(image);
        self
    }

    pub fn after_image(mut self, image: ColumnMap) -> Self {
        self.after_image = Some(image);
        self
    }

    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    pub fn transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = Some(id.into());
        self
    }

    pub fn sequence_number(mut self, seq: i64) -> Self {
        self.sequence_number = Some(seq);
        self
    }

    /// Replace the whole metadata map.
    pub fn adapter_metadata(mut self, metadata: ColumnMap) -> Self {
        self.adapter_metadata = metadata;
        self
    }

    /// Add a single metadata entry.
    pub fn metadata_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.adapter_metadata.insert(key.into(), value);
        self
    }

    /// Validate and build the event.
    pub fn build(self) -> Result<ChangeEvent> {
        let table_name = self
            .table_name
            .ok_or_else(|| AuditStreamError::validation("table_name is required"))?;
        let action = self
            .action
            .ok_or_else(|| AuditStreamError::validation("action is required"))?;

        match action {
            Action::Insert => {
                let after_ok = self.after_image.as_ref().is_some_and(|img| !img.is_empty());
                if !after_ok || self.before_image.is_some() {
                    return Err(AuditStreamError::validation(
                        "INSERT requires after_image, forbids before_image",
                    ));
                }
            }
            Action::Update => {
                if self.before_image.is_none() || self.after_image.is_none() {
                    return Err(AuditStreamError::validation("UPDATE requires both images"));
                }
            }
            Action::Delete => {
                let before_ok = self
                    .before_image
                    .as_ref()
                    .is_some_and(|img| !img.is_empty());
                if !before_ok || self.after_image.is_some() {
                    return Err(AuditStreamError::validation(
                        "DELETE requires before_image, forbids after_image",
                    ));
                }
            }
        }

        Ok(ChangeEvent {
            table_name,
            schema_name: self.schema_name.unwrap_or_else(|| "public".to_string()),
            action,
            primary_key: self.primary_key,
            before_image: self.before_image,
            after_image: self.after_image,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            transaction_id: self.transaction_id,
            sequence_number: self.sequence_number,
            adapter_metadata: self.adapter_metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> ColumnMap {
        match value {
            Value::Object(m) => m,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_insert_event() {
        let event = ChangeEvent::insert("public", "users", map(json!({"id": 1, "name": "Alice"})))
            .unwrap();

        assert_eq!(event.action(), Action::Insert);
        assert!(event.before_image().is_none());
        assert!(event.after_image().is_some());
        assert_eq!(event.qualified_table_name(), "public.users");
    }

    #[test]
    fn test_update_event() {
        let event = ChangeEvent::update(
            "public",
            "users",
            map(json!({"id": 1, "name": "Alice"})),
            map(json!({"id": 1, "name": "Bob"})),
        )
        .unwrap();

        assert_eq!(event.action(), Action::Update);
        assert!(event.before_image().is_some());
        assert!(event.after_image().is_some());
    }

    #[test]
    fn test_delete_event() {
        let event = ChangeEvent::delete("public", "users", map(json!({"id": 1}))).unwrap();

        assert_eq!(event.action(), Action::Delete);
        assert!(event.before_image().is_some());
        assert!(event.after_image().is_none());
    }

    #[test]
    fn test_insert_rejects_before_image() {
        let err = ChangeEvent::builder()
            .table_name("users")
            .action(Action::Insert)
            .before_image(map(json!({"id": 1})))
            .after_image(map(json!({"id": 1})))
            .build()
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "validation failed: INSERT requires after_image, forbids before_image"
        );
    }

    #[test]
    fn test_insert_rejects_empty_after_image() {
        let err = ChangeEvent::insert("public", "users", ColumnMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("INSERT requires after_image, forbids before_image"));
    }

    #[test]
    fn test_update_requires_both_images() {
        let err = ChangeEvent::builder()
            .table_name("users")
            .action(Action::Update)
            .after_image(map(json!({"id": 1})))
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("UPDATE requires both images"));
    }

    #[test]
    fn test_update_allows_empty_images() {
        // Presence is required, emptiness is not checked for UPDATE.
        let event = ChangeEvent::update("public", "users", ColumnMap::new(), ColumnMap::new());
        assert!(event.is_ok());
    }

    #[test]
    fn test_delete_rejects_after_image() {
        let err = ChangeEvent::builder()
            .table_name("users")
            .action(Action::Delete)
            .before_image(map(json!({"id": 1})))
            .after_image(map(json!({"id": 1})))
            .build()
            .unwrap_err();

        assert!(err
            .to_string()
            .contains("DELETE requires before_image, forbids after_image"));
    }

    #[test]
    fn test_changed_columns() {
        let event = ChangeEvent::update(
            "public",
            "users",
            map(json!({"id": 1, "name": "Ken", "email": "a@x"})),
            map(json!({"id": 1, "name": "Sophia", "email": "a@x"})),
        )
        .unwrap();

        assert_eq!(event.changed_columns(), vec!["name".to_string()]);
    }

    #[test]
    fn test_changes_pairs_old_and_new() {
        let event = ChangeEvent::update(
            "public",
            "users",
            map(json!({"id": 1, "name": "Ken", "email": "a@x"})),
            map(json!({"id": 1, "name": "Sophia", "email": "a@x"})),
        )
        .unwrap();

        let changes = event.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes["name"], json!(["Ken", "Sophia"]));
    }

    #[test]
    fn test_changed_columns_empty_for_insert_and_delete() {
        let insert = ChangeEvent::insert("public", "users", map(json!({"id": 1}))).unwrap();
        let delete = ChangeEvent::delete("public", "users", map(json!({"id": 1}))).unwrap();

        assert!(insert.changed_columns().is_empty());
        assert!(delete.changed_columns().is_empty());
        assert!(insert.changes().is_empty());
    }

    #[test]
    fn test_current_image() {
        let insert = ChangeEvent::insert("public", "t", map(json!({"id": 1}))).unwrap();
        let update = ChangeEvent::update(
            "public",
            "t",
            map(json!({"id": 1})),
            map(json!({"id": 2})),
        )
        .unwrap();
        let delete = ChangeEvent::delete("public", "t", map(json!({"id": 3}))).unwrap();

        assert_eq!(insert.current_image(), insert.after_image());
        assert_eq!(update.current_image(), update.after_image());
        assert_eq!(delete.current_image(), delete.before_image());
    }

    #[test]
    fn test_combined_image_after_wins() {
        let event = ChangeEvent::update(
            "public",
            "users",
            map(json!({"id": 1, "name": "Ken", "active": true})),
            map(json!({"id": 1, "name": "Sophia"})),
        )
        .unwrap();

        let combined = event.combined_image();
        assert_eq!(combined["name"], json!("Sophia"));
        assert_eq!(combined["active"], json!(true));
    }

    #[test]
    fn test_builder_round_trip() {
        let at = Utc::now();
        let event = ChangeEvent::builder()
            .schema_name("billing")
            .table_name("invoices")
            .action(Action::Update)
            .primary_key(map(json!({"id": 7})))
            .before_image(map(json!({"id": 7, "total": 10})))
            .after_image(map(json!({"id": 7, "total": 12})))
            .timestamp(at)
            .transaction_id("801")
            .sequence_number(3)
            .metadata_entry("position", json!("0/1949850"))
            .build()
            .unwrap();

        assert_eq!(event.schema_name(), "billing");
        assert_eq!(event.table_name(), "invoices");
        assert_eq!(event.primary_key()["id"], json!(7));
        assert_eq!(event.timestamp(), at);
        assert_eq!(event.transaction_id(), Some("801"));
        assert_eq!(event.sequence_number(), Some(3));
        assert_eq!(event.adapter_metadata()["position"], json!("0/1949850"));
    }

    #[test]
    fn test_defaults() {
        let before = Utc::now();
        let event = ChangeEvent::builder()
            .table_name("users")
            .action(Action::Insert)
            .after_image(map(json!({"id": 1})))
            .build()
            .unwrap();

        assert_eq!(event.schema_name(), "public");
        assert!(event.timestamp() >= before);
        assert!(event.transaction_id().is_none());
        assert!(event.sequence_number().is_none());
        assert!(event.primary_key().is_empty());
    }

    #[test]
    fn test_structural_equality() {
        let at = Utc::now();
        let build = || {
            ChangeEvent::builder()
                .table_name("users")
                .action(Action::Insert)
                .after_image(map(json!({"id": 1})))
                .timestamp(at)
                .build()
                .unwrap()
        };

        assert_eq!(build(), build());
        assert_ne!(
            build(),
            ChangeEvent::builder()
                .table_name("orders")
                .action(Action::Insert)
                .after_image(map(json!({"id": 1})))
                .timestamp(at)
                .build()
                .unwrap()
        );
    }

    #[test]
    fn test_action_parse_and_display() {
        assert_eq!("insert".parse::<Action>().unwrap(), Action::Insert);
        assert_eq!("UPDATE".parse::<Action>().unwrap(), Action::Update);
        assert_eq!("Delete".parse::<Action>().unwrap(), Action::Delete);
        assert_eq!(Action::Insert.to_string(), "INSERT");

        let err = "TRUNCATE".parse::<Action>().unwrap_err();
        assert!(err.to_string().contains("invalid action"));
    }
}
