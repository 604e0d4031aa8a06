//! Capture service orchestration.
//!
//! A [`Service`] owns exactly one [`StreamAdapter`] and one
//! [`RecordStore`](crate::store::RecordStore) and supervises the stream:
//! start checks, the filter-then-persist sink, bounded retry with backoff,
//! and graceful shutdown. Only one stream is ever active per service; the
//! worker pool exists to keep the caller's task unblocked.
//!
//! Failure policy: a persist failure is logged and dropped (capture continues
//! past one bad record); a stream failure is retried per the policy; exhausted
//! retries leave the service flagged running so `status()` stays inspectable
//! until an operator calls `stop()`.

use crate::common::adapter::{sink_fn, StreamAdapter};
use crate::common::config::CaptureConfig;
use crate::common::error::{AuditStreamError, Result};
use crate::common::event::ChangeEvent;
use crate::common::retry::RetryPolicy;
use crate::common::workers::{WorkerPool, WorkerStatsSnapshot};
use crate::store::RecordStore;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bound on waiting for in-flight work during `stop`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause before restarting after a clean end of stream.
const CLEAN_RESTART_PAUSE: Duration = Duration::from_millis(500);

const MAX_WORKERS: usize = 4;

/// Read-only service snapshot.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub running: bool,
    pub streaming: bool,
    /// Adapter's current position rendered as text, when discoverable
    pub position: Option<String>,
    pub retry_count: u32,
    pub workers: WorkerStatsSnapshot,
}

/// Supervises one adapter/store pairing.
pub struct Service {
    adapter: Arc<dyn StreamAdapter>,
    store: Arc<dyn RecordStore>,
    config: Arc<CaptureConfig>,
    retry: RetryPolicy,
    running: Arc<AtomicBool>,
    retry_count: Arc<AtomicU32>,
    pool: WorkerPool,
}

impl Service {
    pub fn new(
        adapter: Arc<dyn StreamAdapter>,
        store: Arc<dyn RecordStore>,
        config: CaptureConfig,
    ) -> Self {
        let retry = RetryPolicy::new(config.max_retry_attempts, config.retry_delay);
        Self {
            adapter,
            store,
            config: Arc::new(config),
            retry,
            running: Arc::new(AtomicBool::new(false)),
            retry_count: Arc::new(AtomicU32::new(0)),
            pool: WorkerPool::new(MAX_WORKERS),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Validate settings, check both ends, and launch the supervision loop.
    ///
    /// Returns `&Self` so calls can chain. A second call while running is a
    /// no-op. On any failed check the service stays stopped and the error
    /// names the failing side.
    pub async fn start(&self) -> Result<&Self> {
        if self.running.load(Ordering::SeqCst) {
            debug!("service already running");
            return Ok(self);
        }

        self.config.validate()?;

        if !self.adapter.test_connection().await {
            return Err(AuditStreamError::adapter(
                "source database connection check failed",
            ));
        }
        if !self.store.test_connection().await {
            return Err(AuditStreamError::adapter(
                "audit store connection check failed",
            ));
        }

        self.running.store(true, Ordering::SeqCst);
        self.retry_count.store(0, Ordering::SeqCst);

        let adapter = self.adapter.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let running = self.running.clone();
        let retry_count = self.retry_count.clone();
        let retry = self.retry.clone();
        self.pool
            .spawn(async move {
                supervise(adapter, store, config, retry, running, retry_count).await;
            })
            .await;

        info!(kind = %self.adapter.kind(), "capture service started");
        Ok(self)
    }

    /// Stop the stream and release resources.
    ///
    /// No-op when not running. Every shutdown step runs even when an earlier
    /// one fails; the first failure is returned after cleanup completes.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping capture service");

        let mut first_error = None;
        if self.adapter.is_streaming() {
            if let Err(e) = self.adapter.stop_streaming().await {
                warn!("adapter stop failed: {}", e);
                first_error = Some(e);
            }
        }

        if !self.pool.shutdown(SHUTDOWN_TIMEOUT).await {
            warn!("supervision task did not finish within the shutdown timeout");
        }

        if let Err(e) = self.store.close().await {
            warn!("audit store close failed: {}", e);
            first_error.get_or_insert(e);
        }

        info!("capture service stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot of the service state. Position lookup is best effort.
    pub async fn status(&self) -> ServiceStatus {
        let position = self
            .adapter
            .current_position()
            .await
            .ok()
            .flatten()
            .map(|p| p.to_string());
        ServiceStatus {
            running: self.running(),
            streaming: self.adapter.is_streaming(),
            position,
            retry_count: self.retry_count(),
            workers: self.pool.stats().snapshot(),
        }
    }

    /// Provision source-side replication objects via the adapter.
    pub async fn setup(&self) -> Result<()> {
        self.adapter.setup().await
    }

    /// Remove source-side replication objects and release the store.
    /// Stops the service first when running.
    pub async fn teardown(&self) -> Result<()> {
        if self.running() {
            self.stop().await?;
        }
        self.adapter.teardown().await?;
        self.store.close().await
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("adapter", &self.adapter.kind())
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("running", &self.running())
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

/// Restart the stream until stopped or retries are exhausted.
async fn supervise(
    adapter: Arc<dyn StreamAdapter>,
    store: Arc<dyn RecordStore>,
    config: Arc<CaptureConfig>,
    retry: RetryPolicy,
    running: Arc<AtomicBool>,
    retry_count: Arc<AtomicU32>,
) {
    while running.load(Ordering::SeqCst) {
        let sink = persist_sink(store.clone(), config.clone());
        match adapter.start_streaming(sink).await {
            Ok(()) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                debug!("stream ended cleanly, restarting");
                tokio::time::sleep(CLEAN_RESTART_PAUSE).await;
            }
            Err(e) => {
                let attempt = retry_count.fetch_add(1, Ordering::SeqCst) + 1;
                if retry.should_retry(attempt) && running.load(Ordering::SeqCst) {
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "stream failed: {}, restarting",
                        e
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    // Deliberately leaves `running` set: the service needs
                    // operator attention, not a silent flip to stopped.
                    error!(
                        attempts = attempt,
                        "stream failed: {}, retries exhausted", e
                    );
                    break;
                }
            }
        }
    }
    debug!("supervision loop exited");
}

/// Sink handed to the adapter: filter, then persist, dropping events the
/// config rejects and logging persist failures without aborting the stream.
fn persist_sink(
    store: Arc<dyn RecordStore>,
    config: Arc<CaptureConfig>,
) -> crate::common::adapter::EventSink {
    sink_fn(move |event: ChangeEvent| {
        let store = store.clone();
        let config = config.clone();
        async move {
            if !config.should_capture(event.table_name(), event.schema_name()) {
                debug!(table = %event.qualified_table_name(), "event filtered out");
                return;
            }
            if let Err(e) = store.persist(&event).await {
                error!(
                    table = %event.qualified_table_name(),
                    action = %event.action(),
                    "dropping event, persist failed: {}",
                    e
                );
            }
        }
    })
}
