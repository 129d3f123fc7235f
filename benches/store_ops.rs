//! Benchmark for hot-path store operations

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use guardian_log::models::QueryRecord;
use guardian_log::store::Store;
use tempfile::TempDir;

fn create_record(n: usize) -> QueryRecord {
    QueryRecord {
        client_id: format!("client-{}", n % 50),
        client_name: format!("Client {}", n % 50),
        domain: format!("host{n}.telemetry.example.org"),
        timestamp: Utc::now(),
        query_type: "A".to_string(),
        answer: None,
        reason: None,
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    group.throughput(Throughput::Elements(1000));

    let records: Vec<QueryRecord> = (0..1000).map(create_record).collect();

    group.bench_function("fingerprint_1000_records", |b| {
        b.iter(|| {
            for record in &records {
                black_box(record.fingerprint());
            }
        });
    });

    group.finish();
}

fn bench_detector_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_detector_path");
    group.throughput(Throughput::Elements(100));

    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("db").to_str().unwrap()).unwrap();
    let records: Vec<QueryRecord> = (0..100).map(create_record).collect();

    // The per-record sequence the detector runs: seen check, mark,
    // baseline check, baseline extend
    group.bench_function("process_100_records", |b| {
        b.iter(|| {
            for record in &records {
                let fp = record.fingerprint();
                let _ = black_box(store.query_seen(&fp).unwrap());
                store.query_mark(&fp).unwrap();
                if !store
                    .baseline_contains(&record.client_id, &record.domain)
                    .unwrap()
                {
                    store
                        .baseline_add(&record.client_id, &record.client_name, &record.domain)
                        .unwrap();
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_detector_path);
criterion_main!(benches);
