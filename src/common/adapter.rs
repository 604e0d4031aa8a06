//! Streaming adapter capability
//!
//! Database-agnostic contract implemented by the PostgreSQL and MySQL
//! adapters. An adapter owns its connections and its replication position;
//! the service layer only ever talks to this trait.

use crate::common::config::AdapterKind;
use crate::common::event::ChangeEvent;
use crate::common::position::Position;
use crate::common::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Callback invoked once per decoded change, in source order.
pub type EventSink = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`EventSink`].
pub fn sink_fn<F, Fut>(f: F) -> EventSink
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Contract every streaming adapter implements.
///
/// Lifecycle per instance: `Idle -> (setup) -> Configured ->
/// (start_streaming) -> Streaming -> (stop_streaming | fatal error) -> Idle`.
/// `setup` is optional before `start_streaming`; adapters verify their
/// replication objects exist either way and fail fast when they are missing.
#[async_trait]
pub trait StreamAdapter: Send + Sync {
    /// Stream changes into `sink` until [`stop_streaming`](Self::stop_streaming)
    /// is called or an unrecoverable error occurs.
    ///
    /// Blocks the calling task for the whole session. Events are delivered
    /// in source order. On failure the internal streaming flag is cleared
    /// *before* the error is returned, so callers always observe a
    /// non-streaming adapter after an error. A clean end of stream returns
    /// `Ok(())`.
    async fn start_streaming(&self, sink: EventSink) -> Result<()>;

    /// Stop an active stream and release adapter-held connections.
    /// Idempotent; safe to call when not streaming.
    async fn stop_streaming(&self) -> Result<()>;

    /// Last seen position, or a live query against the source when nothing
    /// is cached yet. `Ok(None)` only when the position is truly
    /// undiscoverable.
    async fn current_position(&self) -> Result<Option<Position>>;

    /// Idempotently provision source-side replication objects. Existing
    /// objects are detected and left alone.
    async fn setup(&self) -> Result<()>;

    /// Idempotently remove objects created by [`setup`](Self::setup). Never
    /// fails because they are already absent.
    async fn teardown(&self) -> Result<()>;

    /// Lightweight connectivity probe. Logs and returns `false` on failure,
    /// never an error.
    async fn test_connection(&self) -> bool;

    /// Whether a `start_streaming` call is currently active.
    fn is_streaming(&self) -> bool;

    /// Which variant this adapter is.
    fn kind(&self) -> AdapterKind;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagAdapter {
        streaming: AtomicBool,
    }

    #[async_trait]
    impl StreamAdapter for FlagAdapter {
        async fn start_streaming(&self, sink: EventSink) -> Result<()> {
            self.streaming.store(true, Ordering::SeqCst);
            let event = ChangeEvent::insert(
                "public",
                "users",
                serde_json::json!({"id": 1})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )?;
            sink(event).await;
            self.streaming.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_streaming(&self) -> Result<()> {
            self.streaming.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn current_position(&self) -> Result<Option<Position>> {
            Ok(Some(Position::postgres_lsn(0x10)))
        }

        async fn setup(&self) -> Result<()> {
            Ok(())
        }

        async fn teardown(&self) -> Result<()> {
            Ok(())
        }

        async fn test_connection(&self) -> bool {
            true
        }

        fn is_streaming(&self) -> bool {
            self.streaming.load(Ordering::SeqCst)
        }

        fn kind(&self) -> AdapterKind {
            AdapterKind::Postgres
        }
    }

    #[tokio::test]
    async fn test_sink_receives_events() {
        let adapter = FlagAdapter {
            streaming: AtomicBool::new(false),
        };

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = sink_fn(move |event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        });

        adapter.start_streaming(sink).await.unwrap();
        assert!(!adapter.is_streaming());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.table_name(), "users");
    }

    #[tokio::test]
    async fn test_stop_streaming_idempotent() {
        let adapter = FlagAdapter {
            streaming: AtomicBool::new(false),
        };
        adapter.stop_streaming().await.unwrap();
        adapter.stop_streaming().await.unwrap();
        assert!(!adapter.is_streaming());
    }
}
