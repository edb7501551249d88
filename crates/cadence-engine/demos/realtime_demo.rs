//! Realtime scheduler demo: a few managers ticking at 20 Hz alongside
//! sync and async tasks, then a clean shutdown.
//!
//! Run with `RUST_LOG=cadence_engine=debug` to see stage timings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cadence_core::{AsyncManager, Owner, TaskPriority, UpdateCounter, WorkUnit};
use cadence_engine::{RealtimeScheduler, Scheduler, SchedulerConfig, TaskContext};

/// A region with a backlog of block updates it works off during physics.
struct Region {
    name: String,
    sequence: i32,
    backlog: Arc<AtomicU64>,
    snapshots: Arc<AtomicU64>,
}

impl AsyncManager for Region {
    fn name(&self) -> &str {
        &self.name
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn physics(&self, _sub_seq: i32, updates: &UpdateCounter) -> Option<WorkUnit> {
        let backlog = Arc::clone(&self.backlog);
        let updates = updates.clone();
        Some(Box::new(move || {
            // Each pass settles half the backlog; the rest cascades.
            let pending = backlog.load(Ordering::Acquire);
            let settled = pending.div_ceil(2);
            backlog.fetch_sub(settled, Ordering::AcqRel);
            updates.add(settled);
        }))
    }

    fn copy_snapshot(&self) -> Option<WorkUnit> {
        let snapshots = Arc::clone(&self.snapshots);
        Some(Box::new(move || {
            snapshots.fetch_add(1, Ordering::Relaxed);
        }))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cadence_engine=info".parse()?)
                .add_directive("realtime_demo=info".parse()?),
        )
        .init();

    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default())?);
    let mut regions = Vec::new();
    for i in 0..4 {
        let region = Arc::new(Region {
            name: format!("region-{i}"),
            sequence: i % 2,
            backlog: Arc::new(AtomicU64::new(0)),
            snapshots: Arc::new(AtomicU64::new(0)),
        });
        scheduler.add_async_manager(Arc::clone(&region) as Arc<dyn AsyncManager>)?;
        regions.push(region);
    }

    // Every second a sync task drops new work on the first region.
    let backlog = Arc::clone(&regions[0].backlog);
    scheduler.task_manager().schedule_sync_repeating(
        "world-events",
        move |_: &TaskContext<'_>| {
            backlog.fetch_add(1_000, Ordering::AcqRel);
        },
        0,
        1_000,
        TaskPriority::Normal,
    )?;

    // A long-life async task reading under the snapshot lock.
    let reader = Arc::clone(&scheduler);
    let snapshots = Arc::clone(&regions[1].snapshots);
    scheduler.task_manager().schedule_async(
        "stats",
        move |ctx: &TaskContext<'_>| {
            let owner = Owner::new("stats");
            while ctx.sleep(Duration::from_millis(500)) {
                if let Some(n) = reader.safe_call(&owner, || snapshots.load(Ordering::Relaxed)) {
                    tracing::info!(snapshots = n, "region-1 snapshot count");
                }
            }
        },
        true,
    )?;

    scheduler.submit_final_task(|| tracing::info!("final task ran"), false);
    scheduler.set_setup_complete();

    let mut realtime = RealtimeScheduler::start(Arc::clone(&scheduler))?;
    thread::sleep(Duration::from_secs(3));
    if let Some(report) = realtime.latest_report() {
        tracing::info!(
            tick = report.tick,
            total_us = report.metrics.total_us,
            passes = report.metrics.convergence_passes,
            "latest tick"
        );
    }

    let report = realtime.stop();
    tracing::info!(
        ticks = report.ticks,
        total_ms = report.total_ms,
        final_tasks = report.final_tasks_run,
        "stopped"
    );
    Ok(())
}
