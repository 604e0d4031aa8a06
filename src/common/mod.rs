//! # Common capture types and traits
//!
//! Database-agnostic building blocks shared by every adapter:
//!
//! - [`ChangeEvent`] - normalized row-change representation
//! - [`StreamAdapter`] - capability trait the capture sources implement
//! - [`Service`] - adapter/store orchestration and retry supervision
//! - [`CaptureConfig`] - validated pipeline settings
//! - [`FilterRule`] - table/schema filtering
//! - [`Position`] - replication position tokens, [`PositionStore`] persistence
//! - [`RetryPolicy`] - bounded backoff for the supervision loop
//! - [`WorkerPool`] - bounded task execution
//! - [`Validator`] - identifier and connection-URL validation
//!
//! ```text
//! source DB -> StreamAdapter (decode) -> ChangeEvent -> Service (filter)
//!           -> RecordStore (persist) -> audit DB
//! ```

mod adapter;
mod config;
mod error;
mod event;
mod filter;
mod position;
mod retry;
mod service;
mod validation;
mod workers;

pub use adapter::*;
pub use config::*;
pub(crate) use config::redact_url;
pub use error::*;
pub use event::*;
pub use filter::*;
pub use position::*;
pub use retry::*;
pub use service::*;
pub use validation::*;
pub use workers::*;
