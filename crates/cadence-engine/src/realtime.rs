//! User-facing `RealtimeScheduler`: runs a [`Scheduler`] on a dedicated
//! tick thread at its fixed period.
//!
//! # Architecture
//!
//! ```text
//! User Thread(s)              Tick Thread                Pools
//!     |                           |                        |
//!     |--schedule_*()------------>| heartbeat()            |
//!     |   [task queue]            | start-tick stages ---->| stage pool
//!     |--schedule_core_task()---->| writer lock            |
//!     |   [core channel]          | convergence loop ----->| stage pool
//!     |                           | snapshot stages ------>| stage pool
//!     |                           | core tasks             |
//!     |                           | park(period - elapsed) |
//!     |--stop()------------------>| unpark, loop exits     |
//!     |                           | shutdown sequence ---->| task pool drains
//!     |<--ShutdownReport----------| join                   |
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::error;

use crate::config::ConfigError;
use crate::metrics::TickReport;
use crate::scheduler::Scheduler;
use crate::tick_thread::{ShutdownSummary, TickThreadState};

/// Report from [`RealtimeScheduler::stop`].
#[derive(Clone, Debug, Default)]
pub struct ShutdownReport {
    /// Total time spent stopping, including the shutdown sequence.
    pub total_ms: u64,
    /// Whether the tick thread was joined successfully.
    pub tick_joined: bool,
    /// Ticks completed before the loop stopped.
    pub ticks: u64,
    /// Rounds of waiting for async tasks that timed out.
    pub async_wait_rounds: u32,
    /// Last-tick tasks run during shutdown.
    pub last_tick_tasks_run: usize,
    /// Final tasks run during shutdown.
    pub final_tasks_run: usize,
}

/// A scheduler ticking in real time on its own thread.
pub struct RealtimeScheduler {
    scheduler: Arc<Scheduler>,
    shutdown_flag: Arc<AtomicBool>,
    tick_stopped: Arc<AtomicBool>,
    latest: Arc<Mutex<Option<TickReport>>>,
    tick_thread: Option<JoinHandle<ShutdownSummary>>,
}

impl RealtimeScheduler {
    /// Spawn the tick thread for `scheduler`.
    ///
    /// Ticking starts immediately. The scheduler stays reachable through
    /// [`scheduler`](Self::scheduler) for registering managers and
    /// scheduling tasks.
    pub fn start(scheduler: Arc<Scheduler>) -> Result<Self, ConfigError> {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let tick_stopped = Arc::new(AtomicBool::new(false));
        let latest = Arc::new(Mutex::new(None));

        let state = TickThreadState::new(
            Arc::clone(&scheduler),
            Arc::clone(&shutdown_flag),
            Arc::clone(&tick_stopped),
            Arc::clone(&latest),
        );
        let tick_thread = thread::Builder::new()
            .name("cadence-main".into())
            .spawn(move || state.run())
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("tick thread: {e}"),
            })?;

        Ok(Self {
            scheduler,
            shutdown_flag,
            tick_stopped,
            latest,
            tick_thread: Some(tick_thread),
        })
    }

    /// The scheduler being ticked.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Report of the most recent completed tick.
    pub fn latest_report(&self) -> Option<TickReport> {
        self.latest.lock().clone()
    }

    /// Whether the tick thread is still ticking or shutting down.
    pub fn is_running(&self) -> bool {
        self.tick_thread.is_some() && !self.tick_stopped.load(Ordering::Acquire)
    }

    /// Stop ticking, run the shutdown sequence on the tick thread and join
    /// it. Blocks until every async task has finished.
    ///
    /// Calling `stop` again returns an empty report.
    pub fn stop(&mut self) -> ShutdownReport {
        let Some(handle) = self.tick_thread.take() else {
            return ShutdownReport {
                tick_joined: true,
                ..Default::default()
            };
        };

        let start = Instant::now();
        self.shutdown_flag.store(true, Ordering::Release);
        // The loop sleeps with park_timeout, so this wakes it at once.
        handle.thread().unpark();

        let (tick_joined, summary) = match handle.join() {
            Ok(summary) => (true, summary),
            Err(_) => {
                error!("tick thread panicked");
                (false, ShutdownSummary::default())
            }
        };

        ShutdownReport {
            total_ms: start.elapsed().as_millis() as u64,
            tick_joined,
            ticks: summary.ticks,
            async_wait_rounds: summary.async_wait_rounds,
            last_tick_tasks_run: summary.last_tick_tasks_run,
            final_tasks_run: summary.final_tasks_run,
        }
    }
}

impl Drop for RealtimeScheduler {
    fn drop(&mut self) {
        if self.tick_thread.is_some() {
            self.stop();
        }
    }
}

impl std::fmt::Debug for RealtimeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeScheduler")
            .field("running", &self.is_running())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchedulerConfig, TaskManagerConfig};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn scheduler(period_ms: u64) -> Arc<Scheduler> {
        let config = SchedulerConfig {
            tick_period_ms: period_ms,
            stage_worker_count: Some(2),
            task_manager: TaskManagerConfig {
                pool_threads: 2,
                ..Default::default()
            },
            ..SchedulerConfig::default()
        };
        Arc::new(Scheduler::new(config).unwrap())
    }

    #[test]
    fn ticks_then_stops() {
        let mut rt = RealtimeScheduler::start(scheduler(5)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while rt.latest_report().map_or(0, |r| r.tick) < 3 {
            assert!(Instant::now() < deadline, "no ticks within 5s");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(rt.is_running());
        let report = rt.stop();
        assert!(report.tick_joined);
        assert!(report.ticks >= 3);
        assert!(!rt.is_running());
        assert_eq!(rt.stop().ticks, 0);
    }

    #[test]
    fn stop_wakes_slow_tick_rate() {
        let mut rt = RealtimeScheduler::start(scheduler(5_000)).unwrap();
        thread::sleep(Duration::from_millis(50));
        let report = rt.stop();
        assert!(report.total_ms < 2_000, "stop took {}ms", report.total_ms);
    }

    #[test]
    fn shutdown_runs_last_tick_then_final_tasks() {
        let sched = scheduler(5);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        sched.submit_final_task(move || o.lock().push("final"), false);
        let o = Arc::clone(&order);
        sched.submit_last_tick_task(move || o.lock().push("last-tick"));

        let mut rt = RealtimeScheduler::start(Arc::clone(&sched)).unwrap();
        let report = rt.stop();
        assert_eq!(report.last_tick_tasks_run, 1);
        assert_eq!(report.final_tasks_run, 1);
        assert_eq!(*order.lock(), vec!["last-tick", "final"]);

        // After the tick thread has exited, submissions run at once.
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        sched.submit_final_task(move || { r.fetch_add(1, Ordering::SeqCst); }, true);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let sched = scheduler(5);
        let mut rt = RealtimeScheduler::start(Arc::clone(&sched)).unwrap();
        rt.stop();
        assert!(!sched.task_manager().is_alive());
        assert!(sched
            .task_manager()
            .schedule_async("late", |_| {}, false)
            .is_err());
    }
}
