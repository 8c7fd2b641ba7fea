//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! These benchmarks measure the paths that dominate recording cost: row
//! encoding on every value, and bundle packing/unpacking on every
//! rotation.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flight_recorder::recording::{pack, unpack, BundleSource, Compression, FieldValue, Row};
use std::path::Path;

/// Benchmark Row::encode_into - called once per recorded value
fn bench_row_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_encode");
    group.throughput(Throughput::Elements(1));

    for fields in [3, 6, 12] {
        let values: Vec<FieldValue> = (0..fields)
            .map(|i| FieldValue::Float(i as f64 * 0.125))
            .collect();
        let row = Row::new(12.345678, Some(12.3401), values);

        group.bench_function(format!("fields_{}", fields), |b| {
            let mut buf = String::with_capacity(256);
            b.iter(|| {
                buf.clear();
                black_box(&row).encode_into(&mut buf, ';', 3);
                black_box(buf.len())
            })
        });
    }

    let text = Row::new(
        1.0,
        None,
        vec![FieldValue::Text("fix".into()), FieldValue::Bool(true), FieldValue::Int(-42)],
    );
    group.bench_function("mixed_types", |b| {
        let mut buf = String::with_capacity(64);
        b.iter(|| {
            buf.clear();
            black_box(&text).encode_into(&mut buf, ';', 3);
        })
    });

    group.finish();
}

fn write_stream_files(dir: &Path, streams: usize, rows: usize) -> Vec<BundleSource> {
    (0..streams)
        .filter_map(|s| {
            let path = dir.join(format!("stream{}.csv", s));
            let mut body = String::from("t;x;y;z\n");
            for i in 0..rows {
                let row = Row::new(
                    i as f64 * 0.02,
                    None,
                    vec![(i as f64).sin().into(), (i as f64).cos().into(), 9.81.into()],
                );
                row.encode_into(&mut body, ';', 3);
            }
            std::fs::write(&path, body).ok()?;
            BundleSource::from_path(path)
        })
        .collect()
}

/// Benchmark pack/unpack of one iteration worth of stream files
fn bench_bundle(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle");
    let tmp = tempfile::tempdir().expect("tempdir");
    let sources = write_stream_files(tmp.path(), 4, 250);
    let bytes: u64 = sources
        .iter()
        .filter_map(|s| std::fs::metadata(&s.path).ok())
        .map(|m| m.len())
        .sum();
    group.throughput(Throughput::Bytes(bytes));

    for (name, compression) in [
        ("pack_plain", Compression::None),
        ("pack_zstd_1", Compression::Zstd { level: 1 }),
        ("pack_zstd_3", Compression::Zstd { level: 3 }),
    ] {
        let dest = tmp.path().join(format!("{}.bundle", name));
        group.bench_function(name, |b| {
            b.iter(|| pack(&dest, black_box(&sources), 7, 0, compression, |_| {}).expect("pack"))
        });
    }

    let dest = tmp.path().join("read.bundle");
    pack(&dest, &sources, 7, 0, Compression::Zstd { level: 3 }, |_| {}).expect("pack");
    group.bench_function("unpack_zstd_3", |b| {
        b.iter(|| unpack(black_box(&dest)).expect("unpack"))
    });

    group.finish();
}

criterion_group!(benches, bench_row_encode, bench_bundle);

criterion_main!(benches);
