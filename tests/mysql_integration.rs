//! Live MySQL pipeline tests
//!
//! Requires a MySQL 8+ (or MariaDB 10.5+) server with row-format binlogs:
//!
//! ```text
//! docker run --rm -d -e MYSQL_ROOT_PASSWORD=root -e MYSQL_DATABASE=app \
//!     -p 3306:3306 mysql:8.0 --binlog-format=ROW
//! ```
//!
//! Connection settings come from `AUDITSTREAM_MYSQL_HOST` / `_PORT` /
//! `_USER` / `_PASSWORD` / `_DATABASE` (defaults: localhost / 3306 / root /
//! root / app).
//!
//! Ignored by default. Run with:
//! cargo test --test mysql_integration -- --ignored --test-threads=1

#![cfg(feature = "mysql")]

mod common;

use auditstream::common::sink_fn;
use auditstream::mysql::{MysqlAdapter, MysqlAdapterConfig};
use auditstream::{Action, ChangeEvent, StreamAdapter};
use common::{env_or, init_logging, unique, wait_for};
use mysql_async::prelude::Queryable;
use serde_json::json;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

fn adapter_config() -> MysqlAdapterConfig {
    MysqlAdapterConfig::new(
        env_or("AUDITSTREAM_MYSQL_HOST", "localhost"),
        env_or("AUDITSTREAM_MYSQL_USER", "root"),
    )
    .with_port(
        env_or("AUDITSTREAM_MYSQL_PORT", "3306")
            .parse()
            .expect("numeric AUDITSTREAM_MYSQL_PORT"),
    )
    .with_password(env_or("AUDITSTREAM_MYSQL_PASSWORD", "root"))
    .with_database(env_or("AUDITSTREAM_MYSQL_DATABASE", "app"))
    .with_server_id(4097)
}

async fn sql_conn(config: &MysqlAdapterConfig) -> anyhow::Result<mysql_async::Conn> {
    let opts = mysql_async::OptsBuilder::default()
        .ip_or_hostname(config.host.clone())
        .tcp_port(config.port)
        .user(Some(config.username.clone()))
        .pass(config.password.clone())
        .db_name(config.database.clone());
    Ok(mysql_async::Conn::new(opts).await?)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test mysql_integration -- --ignored
#[serial]
async fn test_mysql_capture_roundtrip() -> anyhow::Result<()> {
    init_logging();
    let config = adapter_config();
    let table = unique("audit_it_users");

    let mut sql = sql_conn(&config).await?;
    sql.query_drop(format!("DROP TABLE IF EXISTS {table}"))
        .await?;
    sql.query_drop(format!(
        "CREATE TABLE {table} (id BIGINT PRIMARY KEY, email VARCHAR(128) NOT NULL)"
    ))
    .await?;

    let adapter = Arc::new(MysqlAdapter::new(config.clone()));
    assert!(adapter.test_connection().await);
    adapter.setup().await?;

    let events: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = events.clone();
    let sink = sink_fn(move |event| {
        let captured = captured.clone();
        async move {
            captured.lock().unwrap().push(event);
        }
    });

    let streamer = adapter.clone();
    let stream = tokio::spawn(async move { streamer.start_streaming(sink).await });
    wait_for("stream to come up", || adapter.is_streaming()).await;
    // Give the dump a moment to reach the current position before writing.
    sleep(Duration::from_millis(1500)).await;

    sql.query_drop(format!(
        "INSERT INTO {table} (id, email) VALUES (1, 'a@b.c')"
    ))
    .await?;
    sql.query_drop(format!("UPDATE {table} SET email = 'c@d.e' WHERE id = 1"))
        .await?;
    sql.query_drop(format!("DELETE FROM {table} WHERE id = 1"))
        .await?;

    wait_for("three captured events", || {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.table_name() == table)
            .count()
            >= 3
    })
    .await;

    let all = events.lock().unwrap().clone();
    let ours: Vec<_> = all.iter().filter(|e| e.table_name() == table).collect();
    assert_eq!(ours.len(), 3);

    assert_eq!(ours[0].action(), Action::Insert);
    assert_eq!(ours[0].after_image().unwrap()["email"], json!("a@b.c"));
    assert_eq!(ours[0].primary_key()["id"], json!(1));

    assert_eq!(ours[1].action(), Action::Update);
    assert_eq!(ours[1].before_image().unwrap()["email"], json!("a@b.c"));
    assert_eq!(ours[1].after_image().unwrap()["email"], json!("c@d.e"));

    assert_eq!(ours[2].action(), Action::Delete);
    assert_eq!(ours[2].before_image().unwrap()["id"], json!(1));

    assert!(ours.iter().all(|e| e.transaction_id().is_some()));
    assert!(adapter.current_position().await?.is_some());

    adapter.stop_streaming().await?;
    stream.await??;
    adapter.teardown().await?;
    sql.query_drop(format!("DROP TABLE IF EXISTS {table}"))
        .await?;
    sql.disconnect().await.ok();
    Ok(())
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_mysql_position_names_a_binlog_file() -> anyhow::Result<()> {
    init_logging();
    let adapter = MysqlAdapter::new(adapter_config());
    let position = adapter
        .current_position()
        .await?
        .expect("binlog position always resolves when log_bin is on");

    let (file, offset) = position.binlog().expect("mysql position variant");
    assert!(!file.is_empty());
    assert!(offset >= 4, "offset {offset} sits inside the file magic");
    Ok(())
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_mysql_setup_rejects_colliding_server_id() -> anyhow::Result<()> {
    init_logging();
    let config = adapter_config();

    let mut sql = sql_conn(&config).await?;
    let source_id: Option<u64> = sql.query_first("SELECT @@global.server_id").await?;
    sql.disconnect().await.ok();
    let source_id = source_id.expect("server reports its id");

    let adapter = MysqlAdapter::new(config.with_server_id(source_id as u32));
    let err = adapter.setup().await.unwrap_err();
    assert!(err.to_string().contains("collides"));
    Ok(())
}
