//! Execution wrapper for one in-flight async task pulse.
//!
//! A worker waits out the task's remaining delay, pulses it once, asks the
//! manager to re-arm the task if it repeats, and removes itself from the
//! manager's active set. Long-life tasks get a dedicated thread; everything
//! else runs on the manager's task pool.
//!
//! The worker's lifecycle is a three-state atomic machine:
//!
//! ```text
//! NOT_SUBMITTED --start()--> SUBMITTED
//!       |                        |
//!       +------interrupt()-------+--> CANCELLED
//! ```
//!
//! A worker cancelled before submission never runs.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use cadence_core::{Owner, TaskId};
use tracing::{debug, error};

use crate::task::Task;
use crate::task_manager::TaskManagerShared;

const NOT_SUBMITTED: u8 = 0;
const SUBMITTED: u8 = 1;
const CANCELLED: u8 = 2;

/// One in-flight execution of an async task.
pub struct Worker {
    task: Arc<Task>,
    state: AtomicU8,
    finished: AtomicBool,
}

impl Worker {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            state: AtomicU8::new(NOT_SUBMITTED),
            finished: AtomicBool::new(false),
        }
    }

    /// The id of the task this worker runs.
    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    /// The owner of the task this worker runs.
    pub fn owner(&self) -> &Owner {
        self.task.owner()
    }

    /// The task this worker runs.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Whether the worker has been interrupted.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Interrupt the worker: wakes the task body from interruptible sleeps
    /// and prevents a pending start.
    pub fn interrupt(&self) {
        self.state.store(CANCELLED, Ordering::Release);
        self.task.cancel_token().cancel();
    }

    /// Submit the worker for execution. Returns `false` if it was not
    /// submitted: it was cancelled first, its thread could not be spawned,
    /// or `pool` is `None` because the manager has shut down. The caller
    /// then owns the cleanup.
    pub(crate) fn start(
        self: &Arc<Self>,
        manager: Weak<TaskManagerShared>,
        pool: Option<&rayon::ThreadPool>,
    ) -> bool {
        if self
            .state
            .compare_exchange(NOT_SUBMITTED, SUBMITTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.finished.store(true, Ordering::Release);
            return false;
        }

        let worker = Arc::clone(self);
        let job = move || worker.run(&manager);

        if self.task.is_long_life() {
            let spawned = thread::Builder::new()
                .name(format!("cadence-task-{}", self.task.id()))
                .spawn(job);
            if let Err(e) = spawned {
                error!(task_id = %self.task.id(), error = %e, "failed to spawn long-life task thread");
                self.finished.store(true, Ordering::Release);
                return false;
            }
        } else if let Some(pool) = pool {
            pool.spawn(job);
        } else {
            debug!(task_id = %self.task.id(), "task pool closed, worker not run");
            self.finished.store(true, Ordering::Release);
            return false;
        }
        true
    }

    fn run(&self, manager: &Weak<TaskManagerShared>) {
        let Some(shared) = manager.upgrade() else {
            return;
        };
        let wait = self.task.time_until_due();
        let cancelled = !wait.is_zero() && self.task.cancel_token().wait(wait);
        if !cancelled && !self.is_cancelled() {
            shared.pulse_async(&self.task);
        }
        drop(shared);
        self.finish(manager);
    }

    /// Re-arm the task, then leave the manager's active set. Runs at most
    /// once. A re-armed task gets a fresh worker under the same id, which
    /// `remove_worker` leaves in place.
    fn finish(&self, manager: &Weak<TaskManagerShared>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = manager.upgrade() {
            shared.repeat_schedule(&self.task);
            shared.remove_worker(self);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("task_id", &self.task.id())
            .field("owner", self.task.owner())
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}
