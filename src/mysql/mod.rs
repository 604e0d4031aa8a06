//! MySQL/MariaDB change capture over binlog replication
//!
//! Requires `binlog_format = ROW` (or `MIXED`) on MySQL 5.7+ or MariaDB
//! 10.2+. The adapter registers as a replica, requests a binlog dump and
//! assembles row events into
//! [`ChangeEvent`](crate::common::ChangeEvent)s at transaction commit.
//!
//! ```text
//! binlog -> BinlogClient -> BinlogDecoder -> TransactionBuffer -> sink
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use auditstream::mysql::{MysqlAdapter, MysqlAdapterConfig};
//! use auditstream::common::{sink_fn, StreamAdapter};
//!
//! # async fn example() -> auditstream::common::Result<()> {
//! let config = MysqlAdapterConfig::new("localhost", "repl")
//!     .with_password("secret")
//!     .with_database("app")
//!     .with_server_id(1001);
//!
//! let adapter = MysqlAdapter::new(config);
//! adapter.setup().await?;
//! adapter
//!     .start_streaming(sink_fn(|event| async move {
//!         println!("{} on {}", event.action(), event.qualified_table_name());
//!     }))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod adapter;
pub mod client;
pub mod decoder;

pub use adapter::{MysqlAdapter, MysqlAdapterConfig};
pub use client::{BinlogClient, BinlogStream};
pub use decoder::{
    BinlogDecoder, BinlogError, BinlogEvent, ColumnType, ColumnValue, EventHeader, EventType,
    FormatDescriptionEvent, GtidEvent, QueryEvent, RotateEvent, RowImage, RowsEvent, TableMapEvent,
};
