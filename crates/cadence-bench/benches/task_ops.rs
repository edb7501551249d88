//! Criterion micro-benchmarks for task scheduling and heartbeat polling.

use std::hint::black_box;

use cadence_bench::bench_config;
use cadence_core::TaskPriority;
use cadence_engine::TaskManager;
use criterion::{criterion_group, criterion_main, Criterion};

/// Benchmark: schedule 1000 delayed sync tasks, then heartbeat them all due.
fn bench_schedule_and_drain_1k(c: &mut Criterion) {
    let config = bench_config();

    c.bench_function("task_schedule_drain_1k", |b| {
        b.iter(|| {
            let tm = TaskManager::secondary("bench", &config, None, 0);
            for i in 0..1000u64 {
                tm.schedule_sync_delayed("bench", |_| {}, i % 500, TaskPriority::Normal)
                    .unwrap();
            }
            let mut pulsed = 0;
            for _ in 0..10 {
                pulsed += tm.heartbeat(50);
            }
            black_box(pulsed);
        });
    });
}

/// Benchmark: heartbeat over 1000 repeating tasks, a tenth due per tick.
fn bench_heartbeat_repeating_1k(c: &mut Criterion) {
    let config = bench_config();
    let tm = TaskManager::secondary("bench", &config, None, 0);
    for i in 0..1000u64 {
        tm.schedule_sync_repeating("bench", |_| {}, i % 500, 500, TaskPriority::Normal)
            .unwrap();
    }

    c.bench_function("task_heartbeat_repeating_1k", |b| {
        b.iter(|| black_box(tm.heartbeat(50)));
    });
}

criterion_group!(benches, bench_schedule_and_drain_1k, bench_heartbeat_repeating_1k);
criterion_main!(benches);
