use backend::{HistoryTreeBackend, HtConfig, Value};
use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::{tempdir, TempDir};

const N: i64 = 20_000;
const ATTRIBUTES: i64 = 16;

/// Builds a finished history where every attribute changes every
/// `ATTRIBUTES` time units.
fn build() -> (TempDir, HistoryTreeBackend) {
    let dir = tempdir().unwrap();
    let config = HtConfig::with_params(dir.path().join("bench.ht"), 4096, 8, 1, 0).unwrap();
    let backend = HistoryTreeBackend::new(config).unwrap();
    for i in 0..N {
        let start = (i / ATTRIBUTES) * ATTRIBUTES;
        backend
            .insert_past_state(start, start + ATTRIBUTES - 1, (i % ATTRIBUTES) as u32, Value::Long(i))
            .unwrap();
    }
    backend.finished_building(N).unwrap();
    (dir, backend)
}

fn full_query(c: &mut Criterion) {
    let (_dir, backend) = build();
    c.bench_function("do_query_1k_points", |b| {
        b.iter(|| {
            for t in (0..N).step_by(20) {
                criterion::black_box(backend.do_query(t).unwrap());
            }
        });
    });
}

fn singular_query(c: &mut Criterion) {
    let (_dir, backend) = build();
    c.bench_function("do_singular_query_1k_points", |b| {
        b.iter(|| {
            for t in (0..N).step_by(20) {
                let attribute = (t % ATTRIBUTES) as u32;
                criterion::black_box(backend.do_singular_query(t, attribute).unwrap());
            }
        });
    });
}

criterion_group!(benches, full_query, singular_query);

criterion_main!(benches);
