//! Tick loop pacing, overload detection and the shutdown sequence.
//!
//! The tick thread keeps an expected start time for the next tick and
//! advances it by one period after every tick. A tick that starts more than
//! one period late raises the heavy-load flag; falling more than
//! `catch_up_limit_ms` behind resets the clock instead of trying to catch
//! up. Between ticks the thread parks, so `stop()` wakes it immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::load::monotonic_nanos;
use crate::metrics::TickReport;
use crate::scheduler::Scheduler;

/// Snapshot copies run after the last-tick tasks, letting work they
/// queued settle.
const SETTLE_COPIES: usize = 3;

/// What the shutdown sequence did.
#[derive(Clone, Debug, Default)]
pub(crate) struct ShutdownSummary {
    pub ticks: u64,
    pub async_wait_rounds: u32,
    pub last_tick_tasks_run: usize,
    pub final_tasks_run: usize,
}

/// State held by the tick thread's main loop.
pub(crate) struct TickThreadState {
    scheduler: Arc<Scheduler>,
    shutdown_flag: Arc<AtomicBool>,
    tick_stopped: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<TickReport>>>,
}

impl TickThreadState {
    pub fn new(
        scheduler: Arc<Scheduler>,
        shutdown_flag: Arc<AtomicBool>,
        tick_stopped: Arc<AtomicBool>,
        latest: Arc<Mutex<Option<TickReport>>>,
    ) -> Self {
        Self {
            scheduler,
            shutdown_flag,
            tick_stopped,
            latest,
        }
    }

    /// Main tick loop. Runs until `shutdown_flag` is set, then runs the
    /// shutdown sequence. A tick whose stage waits were interrupted is
    /// logged and the loop carries on.
    pub fn run(self) -> ShutdownSummary {
        let period_ms = self.scheduler.config().tick_period_ms;
        let period_ns = period_ms * 1_000_000;
        let catch_up_ns = self.scheduler.config().catch_up_limit_ms * 1_000_000;
        let mut expected = monotonic_nanos();

        info!(period_ms, "tick thread started");
        loop {
            if self.shutdown_flag.load(Ordering::Acquire) {
                break;
            }

            let now = monotonic_nanos();
            if now < expected {
                thread::park_timeout(Duration::from_nanos(expected - now));
                continue;
            }

            let behind = now - expected;
            let heavy_load = behind > period_ns;
            if behind > catch_up_ns {
                info!(
                    behind_ms = behind / 1_000_000,
                    skipped_ticks = behind / period_ns,
                    "can't keep up, resetting tick clock"
                );
                expected = now;
            }

            self.scheduler.load().begin_tick(heavy_load);
            match self.scheduler.tick(period_ms) {
                Ok(report) => {
                    if report.metrics.interrupted_waits > 0 {
                        warn!(
                            tick = report.tick,
                            interrupted_waits = report.metrics.interrupted_waits,
                            "tick interrupted"
                        );
                    }
                    *self.latest.lock() = Some(report);
                }
                Err(e) => warn!(error = %e, "tick rejected"),
            }
            expected += period_ns;
        }

        let summary = self.shutdown_sequence();
        self.tick_stopped.store(true, Ordering::Release);
        summary
    }

    fn shutdown_sequence(&self) -> ShutdownSummary {
        let scheduler = &self.scheduler;
        let config = scheduler.config();
        let tasks = scheduler.task_manager();
        let mut summary = ShutdownSummary {
            ticks: scheduler.tick_count(),
            ..Default::default()
        };
        info!(ticks = summary.ticks, "tick loop stopped, shutting down");

        scheduler.load().clear();
        self.copy_snapshot("final snapshot copy");

        tasks.heartbeat(config.tick_period_ms << 2);
        if let Err(e) = tasks.shutdown() {
            error!(error = %e, "task manager shutdown failed");
        }

        let mut wait = config.task_manager.shutdown_wait_initial;
        while !tasks.wait_for_async_tasks(wait) {
            let workers = tasks.active_workers();
            if workers.is_empty() {
                break;
            }
            summary.async_wait_rounds += 1;
            info!(
                outstanding = workers.len(),
                "unable to shut down due to async tasks still running"
            );
            for worker in &workers {
                info!(task_id = %worker.task_id(), owner = %worker.owner(), "task is still running");
            }
            wait = (wait * 2).min(config.task_manager.shutdown_wait_cap);
        }

        summary.last_tick_tasks_run = scheduler.run_last_tick_tasks();
        for _ in 0..SETTLE_COPIES {
            self.copy_snapshot("shutdown snapshot copy");
        }

        scheduler.mark_tick_thread_exited();
        summary.final_tasks_run = scheduler.run_final_tasks();
        info!(
            async_wait_rounds = summary.async_wait_rounds,
            last_tick_tasks = summary.last_tick_tasks_run,
            final_tasks = summary.final_tasks_run,
            "shutdown sequence complete"
        );
        summary
    }

    fn copy_snapshot(&self, what: &str) {
        if let Err(e) = self.scheduler.copy_snapshot_with_lock() {
            error!(error = %e, "{what} failed");
        }
    }
}
