//! Benchmark profiles for the Cadence tick scheduler.
//!
//! - [`bench_config`]: a scheduler configuration sized for benchmarking
//! - [`work_managers`]: managers doing a fixed amount of busy work per stage

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::hint::black_box;
use std::sync::Arc;

use cadence_core::{AsyncManager, UpdateCounter, WorkUnit};
use cadence_engine::{SchedulerConfig, TaskManagerConfig};

/// Scheduler configuration for benchmarks: four stage workers, a small
/// task pool and stall logging that never triggers.
pub fn bench_config() -> SchedulerConfig {
    SchedulerConfig {
        stage_worker_count: Some(4),
        stall_timeout_multiplier: 200,
        task_manager: TaskManagerConfig {
            pool_threads: 2,
            ..Default::default()
        },
        ..SchedulerConfig::default()
    }
}

/// A manager that spins for `iterations` in every stage it joins.
pub struct WorkManager {
    name: String,
    sequence: i32,
    iterations: u64,
}

impl WorkManager {
    fn unit(&self) -> Option<WorkUnit> {
        let iterations = self.iterations;
        Some(Box::new(move || {
            let mut acc = 0u64;
            for i in 0..iterations {
                acc = acc.wrapping_mul(31).wrapping_add(i);
            }
            black_box(acc);
        }))
    }
}

impl AsyncManager for WorkManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn start_tick(&self, _stage: usize, _delta_ms: u64) -> Option<WorkUnit> {
        self.unit()
    }

    fn dynamic_updates(&self, _sub_seq: i32, _threshold: u64, _u: &UpdateCounter) -> Option<WorkUnit> {
        self.unit()
    }

    fn physics(&self, _sub_seq: i32, _u: &UpdateCounter) -> Option<WorkUnit> {
        self.unit()
    }

    fn lighting(&self) -> Option<WorkUnit> {
        self.unit()
    }

    fn finalize(&self) -> Option<WorkUnit> {
        self.unit()
    }

    fn pre_snapshot(&self) -> Option<WorkUnit> {
        self.unit()
    }

    fn copy_snapshot(&self) -> Option<WorkUnit> {
        self.unit()
    }
}

/// `count` managers spread over `sequences` sequence slots, each spinning
/// for `iterations` per stage.
pub fn work_managers(count: usize, sequences: i32, iterations: u64) -> Vec<Arc<dyn AsyncManager>> {
    (0..count)
        .map(|i| {
            Arc::new(WorkManager {
                name: format!("work-{i}"),
                sequence: i as i32 % sequences.max(1),
                iterations,
            }) as Arc<dyn AsyncManager>
        })
        .collect()
}
