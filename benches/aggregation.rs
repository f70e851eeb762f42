//! Performance benchmarks for the aggregation engine.
//!
//! Run with: `cargo bench --features synthetic`
//!
//! Uses synthetic fleets so runs are reproducible across machines.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use fleettrace::synthetic::SyntheticFleet;
use fleettrace::{
    map_chunk, reduce_sequential, reduce_tree, split_rows, EngineConfig, FieldAliases,
    Orchestrator, ReduceStrategy, TemporalAnalyzer,
};

fn fleet(devices: usize, records: usize) -> SyntheticFleet {
    SyntheticFleet {
        device_count: devices,
        records_per_device: records,
        ..SyntheticFleet::regina_depot()
    }
}

fn bench_normalize_and_map(c: &mut Criterion) {
    let rows = fleet(20, 500).generate().rows;
    let fields = FieldAliases::default();

    c.bench_function("map_chunk_10k_rows", |b| {
        b.iter(|| {
            let chunks = split_rows(0, &rows, rows.len());
            black_box(map_chunk(chunks[0], &fields))
        })
    });
}

fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");
    let rows = fleet(100, 200).generate().rows;
    let fields = FieldAliases::default();

    for chunk_rows in [500usize, 2_000, 5_000] {
        let partials: Vec<_> = split_rows(0, &rows, chunk_rows)
            .into_iter()
            .map(|chunk| map_chunk(chunk, &fields).partial)
            .collect();

        group.bench_with_input(
            BenchmarkId::new("tree", chunk_rows),
            &partials,
            |b, partials| b.iter(|| black_box(reduce_tree(partials.clone()))),
        );
        group.bench_with_input(
            BenchmarkId::new("sequential", chunk_rows),
            &partials,
            |b, partials| b.iter(|| black_box(reduce_sequential(partials.clone()))),
        );
    }
    group.finish();
}

fn bench_full_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_run");
    group.sample_size(10);

    for devices in [50usize, 200] {
        let chunks = fleet(devices, 200).generate().into_chunks(8);
        let config = EngineConfig {
            reduce_strategy: ReduceStrategy::Tree,
            ..EngineConfig::with_max_gap(Duration::from_secs(600))
        };
        let orchestrator = Orchestrator::new(config).expect("valid config");

        group.bench_with_input(BenchmarkId::from_parameter(devices), &chunks, |b, chunks| {
            b.iter(|| black_box(orchestrator.run_rows(chunks.clone()).expect("run")))
        });
    }
    group.finish();
}

fn bench_temporal(c: &mut Criterion) {
    let chunks = fleet(200, 200).generate().into_chunks(1);
    let orchestrator =
        Orchestrator::new(EngineConfig::with_max_gap(Duration::from_secs(600))).expect("config");
    let aggregate = orchestrator.run_rows(chunks).expect("run").aggregate;
    let analyzer = TemporalAnalyzer::with_max_gap(Duration::from_secs(600)).expect("analyzer");

    c.bench_function("temporal_analyze_200_devices", |b| {
        b.iter(|| black_box(analyzer.analyze(&aggregate)))
    });
}

criterion_group!(
    benches,
    bench_normalize_and_map,
    bench_reduce,
    bench_full_run,
    bench_temporal
);
criterion_main!(benches);
