//! Consensus burst throughput.
//!
//! Measures raw annealing sweeps across matrix sizes and the full engine path
//! (validation, blocking pool hand-off, run bookkeeping).
//!
//! Run with:
//! ```bash
//! cargo bench --bench consensus_annealing
//! ```

#![allow(missing_docs, clippy::unwrap_used)]

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use thunderlane_core::NullEventBus;
use thunderlane_core::config::ConsensusConfig;
use thunderlane_core::consensus::{
    AnnealParams, ConsensusEngine, ConsensusRequest, TriggerReason, anneal, lane_bias,
};

fn params(matrix_size: usize) -> AnnealParams {
    let config = ConsensusConfig::default();
    AnnealParams {
        matrix_size,
        coupling_strength: config.coupling_strength,
        initial_temperature: config.initial_temperature,
        final_temperature: config.final_temperature,
        max_steps: 200,
        convergence_epsilon: config.convergence_epsilon,
        convergence_patience: config.convergence_patience,
        seed: 7,
    }
}

fn bench_anneal(c: &mut Criterion) {
    let mut group = c.benchmark_group("anneal");
    group.measurement_time(Duration::from_secs(5));

    for size in [100usize, 1_000, 10_000] {
        let params = params(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("unbiased", size), &params, |b, params| {
            b.iter(|| black_box(anneal(params, None, None)));
        });

        let bias = lane_bias(size, [1.0, 0.75, 0.5]);
        group.bench_with_input(BenchmarkId::new("lane_biased", size), &params, |b, params| {
            b.iter(|| black_box(anneal(params, Some(&bias), None)));
        });
    }
    group.finish();
}

fn bench_engine_run(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = ConsensusEngine::new(
        ConsensusConfig {
            seed: Some(11),
            ..ConsensusConfig::default()
        },
        None,
        Arc::new(NullEventBus),
    );

    let mut group = c.benchmark_group("consensus_engine");
    group.sample_size(20);
    group.bench_function("run_300", |b| {
        b.to_async(&runtime).iter(|| async {
            let request = ConsensusRequest {
                max_steps: Some(200),
                ..ConsensusRequest::new(300, TriggerReason::Manual)
            };
            black_box(engine.run(request).await.unwrap())
        });
    });
    group.finish();
}

criterion_group!(benches, bench_anneal, bench_engine_run);
criterion_main!(benches);
