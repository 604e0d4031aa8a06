//! Capture pipeline benchmarks
//!
//! Measures the hot paths between a decoded frame and a persisted record:
//! - event assembly and diff computation
//! - filter evaluation
//! - pgoutput frame decoding
//! - binlog frame decoding
//!
//! Run with: cargo bench

use auditstream::common::{ChangeEvent, ColumnMap, FilterRule};
use auditstream::mysql::BinlogDecoder;
use auditstream::postgres::{PgOutputDecoder, PostgresDecode};
use bytes::{BufMut, Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;

fn wide_map(width: usize, offset: i64) -> ColumnMap {
    (0..width)
        .map(|i| (format!("col_{i}"), json!(i as i64 + offset)))
        .collect()
}

fn benchmark_event_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_assembly");

    for width in [5usize, 20, 50] {
        let before = wide_map(width, 0);
        // Half the columns change value.
        let after: ColumnMap = before
            .iter()
            .enumerate()
            .map(|(i, (k, v))| {
                let value = if i % 2 == 0 { json!(i as i64 + 1000) } else { v.clone() };
                (k.clone(), value)
            })
            .collect();

        group.throughput(Throughput::Elements(width as u64));
        group.bench_with_input(
            BenchmarkId::new("build_update", width),
            &(before.clone(), after.clone()),
            |b, (before, after)| {
                b.iter(|| {
                    ChangeEvent::update(
                        black_box("app"),
                        black_box("users"),
                        before.clone(),
                        after.clone(),
                    )
                    .unwrap()
                })
            },
        );

        let event = ChangeEvent::update("app", "users", before, after).unwrap();
        group.bench_with_input(
            BenchmarkId::new("diff_changes", width),
            &event,
            |b, event| b.iter(|| black_box(event).changes()),
        );
    }

    group.finish();
}

fn benchmark_filter_evaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_evaluation");

    let exact = FilterRule::exact("users");
    group.bench_function("exact", |b| {
        b.iter(|| exact.matches(black_box("users")))
    });

    let one_of = FilterRule::one_of((0..100).map(|i| format!("table_{i}")));
    group.bench_function("one_of_100", |b| {
        b.iter(|| one_of.matches(black_box("table_57")))
    });

    let pattern = FilterRule::pattern("audit_*").unwrap();
    group.bench_function("pattern", |b| {
        b.iter(|| pattern.matches(black_box("audit_records")))
    });

    let predicate = FilterRule::predicate(|name| name.starts_with("audit_"));
    group.bench_function("predicate", |b| {
        b.iter(|| predicate.matches(black_box("audit_records")))
    });

    group.finish();
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// pgoutput Relation frame for `public.users (id int4 key, name text,
/// active bool)`.
fn pg_relation_frame() -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'R');
    buf.put_u32(7);
    put_cstr(&mut buf, "public");
    put_cstr(&mut buf, "users");
    buf.put_u8(b'd');
    buf.put_u16(3);
    buf.put_u8(1);
    put_cstr(&mut buf, "id");
    buf.put_i32(23);
    buf.put_i32(-1);
    buf.put_u8(0);
    put_cstr(&mut buf, "name");
    buf.put_i32(25);
    buf.put_i32(-1);
    buf.put_u8(0);
    put_cstr(&mut buf, "active");
    buf.put_i32(16);
    buf.put_i32(-1);
    buf.freeze()
}

/// pgoutput Insert frame with a three-column text tuple.
fn pg_insert_frame() -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'I');
    buf.put_u32(7);
    buf.put_u8(b'N');
    buf.put_u16(3);
    for text in ["42", "alice", "t"] {
        buf.put_u8(b't');
        buf.put_u32(text.len() as u32);
        buf.put_slice(text.as_bytes());
    }
    buf.freeze()
}

fn benchmark_pgoutput_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pgoutput_decode");

    let mut decoder = PgOutputDecoder::new();
    let mut relation = pg_relation_frame();
    decoder.decode(&mut relation).unwrap();
    let insert = pg_insert_frame();

    group.throughput(Throughput::Elements(1));
    group.bench_function("insert", |b| {
        b.iter(|| {
            let mut payload = insert.clone();
            decoder.decode(&mut payload).unwrap()
        })
    });

    group.finish();
}

/// Binlog frame: 19-byte header followed by the payload, no checksum.
fn binlog_frame(event_type: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u32_le(1_700_000_000);
    buf.put_u8(event_type);
    buf.put_u32_le(1);
    buf.put_u32_le(19 + payload.len() as u32);
    buf.put_u32_le(0);
    buf.put_u16_le(0);
    buf.put_slice(payload);
    buf.freeze()
}

/// Table map for `app.users (id INT, name VARCHAR(255))`.
fn binlog_table_map() -> Bytes {
    let mut p = BytesMut::new();
    p.put_slice(&[200, 0, 0, 0, 0, 0]);
    p.put_u16_le(1);
    p.put_u8(3);
    p.put_slice(b"app");
    p.put_u8(0);
    p.put_u8(5);
    p.put_slice(b"users");
    p.put_u8(0);
    p.put_u8(2);
    p.put_slice(&[3, 15]); // Long, Varchar
    p.put_u8(2);
    p.put_u16_le(255);
    p.put_u8(0b0000_0010);
    binlog_frame(0x13, &p)
}

/// WriteRowsV2 frame carrying `rows` identical two-column rows.
fn binlog_write_rows(rows: usize) -> Bytes {
    let mut p = BytesMut::new();
    p.put_slice(&[200, 0, 0, 0, 0, 0]);
    p.put_u16_le(1);
    p.put_u16_le(2);
    p.put_u8(2);
    p.put_u8(0b0000_0011);
    for i in 0..rows {
        p.put_u8(0); // null bitmap
        p.put_i32_le(i as i32);
        p.put_u8(5);
        p.put_slice(b"alice");
    }
    binlog_frame(0x1E, &p)
}

fn benchmark_binlog_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("binlog_decode");

    let mut decoder = BinlogDecoder::new();
    decoder.decode(&binlog_table_map()).unwrap();

    for rows in [1usize, 100] {
        let frame = binlog_write_rows(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(
            BenchmarkId::new("write_rows", rows),
            &frame,
            |b, frame| b.iter(|| decoder.decode(black_box(frame)).unwrap()),
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_event_assembly,
    benchmark_filter_evaluation,
    benchmark_pgoutput_decode,
    benchmark_binlog_decode,
);
criterion_main!(benches);
