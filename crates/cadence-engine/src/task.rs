//! A scheduled task: one entry in a [`TaskManager`](crate::task_manager::TaskManager).

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cadence_core::{Owner, TaskId, TaskPriority};
use parking_lot::Mutex;
use tracing::error;

use crate::barrier::panic_message;
use crate::cancel::CancelToken;
use crate::load::LoadMonitor;

/// Sentinel for "not currently deferred".
const NOT_DEFERRED: u64 = u64::MAX;

/// The body of a task. Called once per pulse.
pub type TaskFn = Box<dyn FnMut(&TaskContext<'_>) + Send + 'static>;

/// What a running task body can see about itself.
pub struct TaskContext<'a> {
    task: &'a Task,
}

impl TaskContext<'_> {
    /// The running task's id.
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// The running task's owner.
    pub fn owner(&self) -> &Owner {
        &self.task.owner
    }

    /// Whether the task has been cancelled. Long-running bodies should
    /// poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        !self.task.is_alive() || self.task.cancel.is_cancelled()
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` if the task was cancelled before the sleep finished.
    pub fn sleep(&self, duration: Duration) -> bool {
        !self.task.cancel.wait(duration)
    }
}

/// Result of one [`Task::pulse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PulseOutcome {
    /// The body ran (possibly panicking; see [`Task::pulse`]).
    Ran,
    /// The body panicked. The task is treated as having run.
    Panicked,
    /// The scheduler was overloaded and the task's priority allowed it to
    /// be pushed back.
    Deferred,
    /// The task was dead or already executing; nothing happened.
    Skipped,
}

/// One schedule entry.
///
/// Shared between the task manager's registry, its priority queue and
/// (for async tasks) a worker, always behind an `Arc`.
pub struct Task {
    id: TaskId,
    owner: Owner,
    work: Mutex<TaskFn>,
    sync: bool,
    delay_ms: u64,
    period_ms: Option<u64>,
    priority: TaskPriority,
    long_life: bool,
    alive: AtomicBool,
    queued: AtomicBool,
    executing: AtomicBool,
    next_call_time: AtomicU64,
    wall_due: Mutex<Instant>,
    defer_begin: AtomicU64,
    cancel: CancelToken,
}

impl Task {
    /// Create a task first due at `up_time + delay_ms`. A period of `None`
    /// or `Some(0)` makes it one-shot.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        owner: Owner,
        work: TaskFn,
        sync: bool,
        up_time: u64,
        delay_ms: u64,
        period_ms: Option<u64>,
        priority: TaskPriority,
        long_life: bool,
    ) -> Self {
        Self {
            id: TaskId::next(),
            owner,
            work: Mutex::new(work),
            sync,
            delay_ms,
            period_ms: period_ms.filter(|p| *p > 0),
            priority,
            long_life,
            alive: AtomicBool::new(true),
            queued: AtomicBool::new(false),
            executing: AtomicBool::new(false),
            next_call_time: AtomicU64::new(up_time.saturating_add(delay_ms)),
            wall_due: Mutex::new(Instant::now() + Duration::from_millis(delay_ms)),
            defer_begin: AtomicU64::new(NOT_DEFERRED),
            cancel: CancelToken::new(),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    /// Unique id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Who scheduled this task.
    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    /// Whether the task runs on the tick thread.
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Whether the task gets its own thread instead of a pool slot.
    pub fn is_long_life(&self) -> bool {
        self.long_life
    }

    /// Scheduling priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Initial delay in milliseconds.
    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Repeat period in milliseconds, or `None` for one-shot tasks.
    pub fn period_ms(&self) -> Option<u64> {
        self.period_ms
    }

    /// Whether the task will run again after its next pulse.
    pub fn is_repeating(&self) -> bool {
        self.period_ms.is_some()
    }

    /// Whether the task has neither finished nor been cancelled.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Whether the body is running right now.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    /// Virtual time (ms) at which the task is next due.
    pub fn next_call_time(&self) -> u64 {
        self.next_call_time.load(Ordering::Acquire)
    }

    /// Wall-clock time left until an async task is next due. Async workers
    /// wait on this; sync tasks follow the virtual uptime instead.
    pub fn time_until_due(&self) -> Duration {
        self.wall_due.lock().saturating_duration_since(Instant::now())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Mark dead and wake any interruptible sleep in the body.
    pub(crate) fn stop(&self) {
        self.alive.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Claim queue membership. Returns `false` if already queued.
    pub(crate) fn set_queued(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release queue membership. Returns `false` if not queued.
    pub(crate) fn set_unqueued(&self) -> bool {
        self.queued
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Run the body once.
    ///
    /// Dead tasks and tasks already executing are skipped. If `load`
    /// reports overload and the priority allows it, the task is pushed
    /// back by `defer_step_ms` instead of running, until it has been
    /// deferred longer than its priority's maximum. After running, the next
    /// call time advances by the period (never into the past) and one-shot
    /// tasks die. A panicking body is logged and treated as having run.
    pub(crate) fn pulse(
        &self,
        up_time: &AtomicU64,
        load: Option<&LoadMonitor>,
        defer_step_ms: u64,
    ) -> PulseOutcome {
        if !self.is_alive() {
            return PulseOutcome::Skipped;
        }

        if load.is_some_and(LoadMonitor::is_overloaded)
            && self.attempt_defer(up_time.load(Ordering::Acquire))
        {
            self.update_call_time(up_time, defer_step_ms);
            return PulseOutcome::Deferred;
        }

        if self
            .executing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PulseOutcome::Skipped;
        }

        let result = {
            let mut work = self.work.lock();
            let ctx = TaskContext { task: self };
            panic::catch_unwind(AssertUnwindSafe(|| (*work)(&ctx)))
        };

        let outcome = match result {
            Ok(()) => PulseOutcome::Ran,
            Err(payload) => {
                error!(
                    task_id = %self.id,
                    owner = %self.owner,
                    panic = %panic_message(payload.as_ref()),
                    "task panicked"
                );
                PulseOutcome::Panicked
            }
        };

        self.update_call_time(up_time, self.period_ms.unwrap_or(0));
        if !self.sync {
            self.update_wall_due();
        }
        if self.period_ms.is_none() {
            self.alive.store(false, Ordering::Release);
        }
        self.executing.store(false, Ordering::Release);
        outcome
    }

    fn attempt_defer(&self, now: u64) -> bool {
        let max = self.priority.max_deferred_ms();
        if max == 0 {
            return false;
        }
        let begin = self.defer_begin.load(Ordering::Acquire);
        if begin == NOT_DEFERRED {
            self.defer_begin.store(now, Ordering::Release);
            true
        } else if now.saturating_sub(begin) > max {
            self.defer_begin.store(NOT_DEFERRED, Ordering::Release);
            false
        } else {
            true
        }
    }

    /// Advance the wall-clock deadline by one period, never into the past.
    fn update_wall_due(&self) {
        let Some(period) = self.period_ms else {
            return;
        };
        let now = Instant::now();
        let mut due = self.wall_due.lock();
        let next = *due + Duration::from_millis(period);
        *due = next.max(now);
    }

    fn update_call_time(&self, up_time: &AtomicU64, offset: u64) {
        if self.is_queued() {
            error!(
                task_id = %self.id,
                "next call time modified while the task is queued"
            );
            return;
        }
        let now = up_time.load(Ordering::Acquire);
        let next = self.next_call_time.load(Ordering::Acquire).saturating_add(offset);
        let next = if next <= now { now + 1 } else { next };
        self.next_call_time.store(next, Ordering::Release);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("sync", &self.sync)
            .field("period_ms", &self.period_ms)
            .field("priority", &self.priority)
            .field("alive", &self.is_alive())
            .field("next_call_time", &self.next_call_time())
            .finish()
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task{{{}, {}}}", self.id, self.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_task(period: Option<u64>, priority: TaskPriority) -> (Task, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let task = Task::new(
            Owner::new("test"),
            Box::new(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            }),
            true,
            0,
            100,
            period,
            priority,
            false,
        );
        (task, runs)
    }

    #[test]
    fn one_shot_runs_once_then_dies() {
        let (task, runs) = counting_task(None, TaskPriority::Normal);
        let clock = AtomicU64::new(100);
        assert_eq!(task.pulse(&clock, None, 50), PulseOutcome::Ran);
        assert!(!task.is_alive());
        assert_eq!(task.pulse(&clock, None, 50), PulseOutcome::Skipped);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_period_is_one_shot() {
        let (task, _) = counting_task(Some(0), TaskPriority::Normal);
        assert!(!task.is_repeating());
    }

    #[test]
    fn repeating_advances_by_period_never_into_past() {
        let (task, _) = counting_task(Some(30), TaskPriority::Normal);
        assert_eq!(task.next_call_time(), 100);
        let clock = AtomicU64::new(100);
        task.pulse(&clock, None, 50);
        assert_eq!(task.next_call_time(), 130);
        assert!(task.is_alive());

        // Far behind: next call snaps to now + 1.
        clock.store(1_000, Ordering::SeqCst);
        task.pulse(&clock, None, 50);
        assert_eq!(task.next_call_time(), 1_001);
    }

    #[test]
    fn async_deadline_advances_by_period_on_the_wall_clock() {
        let task = Task::new(
            Owner::new("test"),
            Box::new(|_| {}),
            false,
            5_000,
            0,
            Some(10_000),
            TaskPriority::Normal,
            false,
        );
        assert!(task.time_until_due().is_zero());

        // The virtual uptime plays no part in the async deadline.
        let clock = AtomicU64::new(5_000);
        assert_eq!(task.pulse(&clock, None, 50), PulseOutcome::Ran);
        let wait = task.time_until_due();
        assert!(wait > Duration::from_millis(9_000) && wait <= Duration::from_millis(10_000));
    }

    #[test]
    fn overload_defers_until_max_then_runs() {
        let (task, runs) = counting_task(Some(10), TaskPriority::Highest);
        let load = LoadMonitor::new(50);
        load.begin_tick(true);
        let clock = AtomicU64::new(100);

        assert_eq!(task.pulse(&clock, Some(&load), 50), PulseOutcome::Deferred);
        assert_eq!(task.next_call_time(), 150);
        clock.store(400, Ordering::SeqCst);
        assert_eq!(task.pulse(&clock, Some(&load), 50), PulseOutcome::Deferred);
        // Deferred for 600 ms > 500 ms maximum: runs despite overload.
        clock.store(700, Ordering::SeqCst);
        assert_eq!(task.pulse(&clock, Some(&load), 50), PulseOutcome::Ran);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn critical_is_never_deferred() {
        let (task, runs) = counting_task(None, TaskPriority::Critical);
        let load = LoadMonitor::new(50);
        load.begin_tick(true);
        let clock = AtomicU64::new(100);
        assert_eq!(task.pulse(&clock, Some(&load), 50), PulseOutcome::Ran);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_body_is_contained() {
        let task = Task::new(
            Owner::new("bad"),
            Box::new(|_| panic!("task failure")),
            true,
            0,
            0,
            None,
            TaskPriority::Normal,
            false,
        );
        let clock = AtomicU64::new(0);
        assert_eq!(task.pulse(&clock, None, 50), PulseOutcome::Panicked);
        assert!(!task.is_alive());
        assert!(!task.is_executing());
    }

    #[test]
    fn queue_flag_is_exclusive() {
        let (task, _) = counting_task(None, TaskPriority::Normal);
        assert!(task.set_queued());
        assert!(!task.set_queued());
        assert!(task.set_unqueued());
        assert!(!task.set_unqueued());
    }

    #[test]
    fn stop_cancels_context() {
        let seen = Arc::new(AtomicBool::new(false));
        let s = Arc::clone(&seen);
        let task = Task::new(
            Owner::new("sleepy"),
            Box::new(move |ctx| {
                s.store(!ctx.sleep(Duration::from_secs(10)), Ordering::SeqCst);
            }),
            false,
            0,
            0,
            None,
            TaskPriority::Normal,
            false,
        );
        task.stop();
        // Dead tasks are skipped entirely.
        let clock = AtomicU64::new(0);
        assert_eq!(task.pulse(&clock, None, 50), PulseOutcome::Skipped);
        assert!(task.cancel_token().is_cancelled());
        assert!(!seen.load(Ordering::SeqCst));
    }
}
