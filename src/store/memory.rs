//! In-memory record store.
//!
//! Backs unit tests and doubles as a spy: persisted records, call counts,
//! and scripted failures are all inspectable.

use crate::common::{AuditStreamError, ChangeEvent, Result};
use crate::store::{AuditRecord, RecordStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Vec-backed [`RecordStore`] with monotonically assigned ids.
///
/// `fail_next(n)` poisons the next `n` persists so failure paths can be
/// exercised without a real database.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<AuditRecord>>,
    next_id: AtomicI64,
    persist_calls: AtomicUsize,
    close_calls: AtomicUsize,
    fail_next: AtomicUsize,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` persist calls with a `Persistence` error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Snapshot of everything persisted so far.
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    /// Number of `persist` invocations, including failed ones.
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Number of `close` invocations.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.records.lock().await.clear();
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn persist(&self, event: &ChangeEvent) -> Result<AuditRecord> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(AuditStreamError::persistence("scripted persist failure"));
        }
        let mut record = AuditRecord::from_event(event);
        record.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.records.lock().await.push(record.clone());
        Ok(record)
    }

    async fn persist_batch(&self, events: &[ChangeEvent]) -> Result<Vec<AuditRecord>> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.push(self.persist(event).await?);
        }
        Ok(out)
    }

    async fn ensure_ready(&self) -> Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
