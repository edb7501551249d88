//! Public scheduling API for delayed and repeating jobs.
//!
//! Sync tasks are queued in a [`TaskPriorityQueue`] and pulsed on the tick
//! thread by [`heartbeat`](TaskManager::heartbeat). Async tasks are wrapped
//! in a [`Worker`] immediately and run off the tick thread: long-life tasks
//! on a dedicated thread, the rest on the task pool.
//!
//! Only the primary task manager runs async tasks and may be shut down.
//! Secondary managers (one per subsystem, with their own uptime) support
//! sync tasks only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cadence_core::{Owner, ScheduleError, ShutdownError, TaskId, TaskPriority};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, SchedulerConfig};
use crate::load::LoadMonitor;
use crate::queue::TaskPriorityQueue;
use crate::task::{PulseOutcome, Task, TaskContext};
use crate::worker::Worker;

/// Poll interval for [`TaskManager::wait_for_async_tasks`].
const WAIT_POLL: Duration = Duration::from_millis(10);

/// State shared between the manager handle and its workers.
pub(crate) struct TaskManagerShared {
    name: String,
    primary: bool,
    alive: AtomicBool,
    up_time: AtomicU64,
    /// The queue lock doubles as the schedule lock: every transition of a
    /// task between queued, running and removed happens under it.
    queue: Mutex<TaskPriorityQueue>,
    active_tasks: Mutex<IndexMap<TaskId, Arc<Task>>>,
    active_workers: Mutex<IndexMap<TaskId, Arc<Worker>>>,
    pool: RwLock<Option<rayon::ThreadPool>>,
    load: Option<Arc<LoadMonitor>>,
    defer_step_ms: u64,
    weak_self: Weak<TaskManagerShared>,
}

impl TaskManagerShared {
    pub(crate) fn up_time(&self) -> u64 {
        self.up_time.load(Ordering::Acquire)
    }

    pub(crate) fn pulse_async(&self, task: &Task) -> PulseOutcome {
        task.pulse(&self.up_time, None, self.defer_step_ms)
    }

    pub(crate) fn remove_worker(&self, worker: &Worker) -> bool {
        let mut workers = self.active_workers.lock();
        let is_this = workers
            .get(&worker.task_id())
            .is_some_and(|w| std::ptr::eq(Arc::as_ptr(w), worker));
        if is_this {
            workers.shift_remove(&worker.task_id());
        }
        is_this
    }

    fn remove_task(&self, task: &Task) -> bool {
        self.active_tasks.lock().shift_remove(&task.id()).is_some()
    }

    /// Queue a sync task or start a worker for an async one. Caller holds
    /// the queue lock.
    fn schedule_locked(&self, queue: &mut TaskPriorityQueue, task: &Arc<Task>) {
        self.active_tasks.lock().insert(task.id(), Arc::clone(task));
        if task.is_sync() {
            queue.add(Arc::clone(task));
        } else {
            let worker = Arc::new(Worker::new(Arc::clone(task)));
            self.active_workers
                .lock()
                .insert(task.id(), Arc::clone(&worker));
            let pool = self.pool.read();
            if !worker.start(self.weak_self.clone(), pool.as_ref()) {
                self.remove_worker(&worker);
                task.stop();
                self.remove_task(task);
            }
        }
    }

    /// Re-arm `task` after a pulse if it is still alive; otherwise drop it
    /// from the active set.
    pub(crate) fn repeat_schedule(&self, task: &Arc<Task>) {
        let mut queue = self.queue.lock();
        if task.is_alive() && self.alive.load(Ordering::Acquire) {
            self.schedule_locked(&mut queue, task);
        } else {
            if task.is_alive() {
                task.stop();
            }
            self.remove_task(task);
        }
    }

    fn schedule(&self, task: Task) -> Result<Arc<Task>, ScheduleError> {
        let task = Arc::new(task);
        let mut queue = self.queue.lock();
        if !self.alive.load(Ordering::Acquire) {
            task.stop();
            return Err(ScheduleError::ShutDown);
        }
        self.schedule_locked(&mut queue, &task);
        Ok(task)
    }

    fn cancel(&self, task: &Arc<Task>) {
        {
            let mut queue = self.queue.lock();
            task.stop();
            if queue.remove(task) {
                self.remove_task(task);
            }
        }
        if !task.is_sync() {
            let worker = self.active_workers.lock().get(&task.id()).cloned();
            if let Some(worker) = worker {
                worker.interrupt();
            }
        }
    }
}

/// Schedules sync and async tasks against a virtual uptime.
pub struct TaskManager {
    shared: Arc<TaskManagerShared>,
}

impl TaskManager {
    /// The primary manager: runs async tasks on a pool of
    /// `config.task_manager.pool_threads` threads and may be shut down.
    ///
    /// When `load` is given, sync tasks defer under overload according to
    /// their priority.
    pub fn primary(
        config: &SchedulerConfig,
        load: Option<Arc<LoadMonitor>>,
    ) -> Result<Self, ConfigError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.task_manager.pool_threads)
            .thread_name(|i| format!("cadence-task-pool-{i}"))
            .build()
            .map_err(|e| ConfigError::ThreadSpawnFailed {
                reason: format!("task pool: {e}"),
            })?;
        Ok(Self::build("primary".into(), true, Some(pool), config, load, 0))
    }

    /// A secondary manager with its own uptime starting at `age_ms`.
    /// Supports sync tasks only.
    pub fn secondary(
        name: impl Into<String>,
        config: &SchedulerConfig,
        load: Option<Arc<LoadMonitor>>,
        age_ms: u64,
    ) -> Self {
        Self::build(name.into(), false, None, config, load, age_ms)
    }

    fn build(
        name: String,
        primary: bool,
        pool: Option<rayon::ThreadPool>,
        config: &SchedulerConfig,
        load: Option<Arc<LoadMonitor>>,
        age_ms: u64,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak_self| TaskManagerShared {
            name,
            primary,
            alive: AtomicBool::new(true),
            up_time: AtomicU64::new(age_ms),
            queue: Mutex::new(TaskPriorityQueue::new(config.bucket_width_ms())),
            active_tasks: Mutex::new(IndexMap::new()),
            active_workers: Mutex::new(IndexMap::new()),
            pool: RwLock::new(pool),
            load,
            defer_step_ms: config.tick_period_ms,
            weak_self: weak_self.clone(),
        });
        Self { shared }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether this is the primary manager.
    pub fn is_primary(&self) -> bool {
        self.shared.primary
    }

    /// Whether the manager still accepts tasks.
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    // ── Sync scheduling ──────────────────────────────────────────

    /// Run `work` once on the tick thread, `delay_ms` after now.
    pub fn schedule_sync_delayed(
        &self,
        owner: impl Into<Owner>,
        work: impl FnMut(&TaskContext<'_>) + Send + 'static,
        delay_ms: u64,
        priority: TaskPriority,
    ) -> Result<Arc<Task>, ScheduleError> {
        self.schedule_sync(owner.into(), Box::new(work), delay_ms, None, priority)
    }

    /// Run `work` on the tick thread every `period_ms`, first after
    /// `delay_ms`.
    pub fn schedule_sync_repeating(
        &self,
        owner: impl Into<Owner>,
        work: impl FnMut(&TaskContext<'_>) + Send + 'static,
        delay_ms: u64,
        period_ms: u64,
        priority: TaskPriority,
    ) -> Result<Arc<Task>, ScheduleError> {
        self.schedule_sync(owner.into(), Box::new(work), delay_ms, Some(period_ms), priority)
    }

    fn schedule_sync(
        &self,
        owner: Owner,
        work: crate::task::TaskFn,
        delay_ms: u64,
        period_ms: Option<u64>,
        priority: TaskPriority,
    ) -> Result<Arc<Task>, ScheduleError> {
        let task = Task::new(
            owner,
            work,
            true,
            self.shared.up_time(),
            delay_ms,
            period_ms,
            priority,
            false,
        );
        self.shared.schedule(task)
    }

    // ── Async scheduling ─────────────────────────────────────────

    /// Run `work` once off the tick thread, as soon as possible.
    pub fn schedule_async(
        &self,
        owner: impl Into<Owner>,
        work: impl FnMut(&TaskContext<'_>) + Send + 'static,
        long_life: bool,
    ) -> Result<Arc<Task>, ScheduleError> {
        self.schedule_async_inner(owner.into(), Box::new(work), 0, None, TaskPriority::Critical, long_life)
    }

    /// Run `work` once off the tick thread after `delay_ms`.
    pub fn schedule_async_delayed(
        &self,
        owner: impl Into<Owner>,
        work: impl FnMut(&TaskContext<'_>) + Send + 'static,
        delay_ms: u64,
        priority: TaskPriority,
        long_life: bool,
    ) -> Result<Arc<Task>, ScheduleError> {
        self.schedule_async_inner(owner.into(), Box::new(work), delay_ms, None, priority, long_life)
    }

    /// Run `work` off the tick thread every `period_ms`, first after
    /// `delay_ms`. Each run takes a task pool slot.
    pub fn schedule_async_repeating(
        &self,
        owner: impl Into<Owner>,
        work: impl FnMut(&TaskContext<'_>) + Send + 'static,
        delay_ms: u64,
        period_ms: u64,
        priority: TaskPriority,
    ) -> Result<Arc<Task>, ScheduleError> {
        self.schedule_async_inner(
            owner.into(),
            Box::new(work),
            delay_ms,
            Some(period_ms),
            priority,
            false,
        )
    }

    fn schedule_async_inner(
        &self,
        owner: Owner,
        work: crate::task::TaskFn,
        delay_ms: u64,
        period_ms: Option<u64>,
        priority: TaskPriority,
        long_life: bool,
    ) -> Result<Arc<Task>, ScheduleError> {
        if !self.is_alive() {
            return Err(ScheduleError::ShutDown);
        }
        if !self.shared.primary {
            return Err(ScheduleError::AsyncNotPermitted);
        }
        let task = Task::new(
            owner,
            work,
            false,
            self.shared.up_time(),
            delay_ms,
            period_ms,
            priority,
            long_life,
        );
        self.shared.schedule(task)
    }

    // ── Heartbeat ────────────────────────────────────────────────

    /// Advance the virtual uptime by `delta_ms` and pulse every due sync
    /// task on the calling thread. Returns the number of tasks pulsed.
    pub fn heartbeat(&self, delta_ms: u64) -> usize {
        let up_time = self.shared.up_time.fetch_add(delta_ms, Ordering::AcqRel) + delta_ms;
        let due = self.shared.queue.lock().poll_due(up_time);
        let mut pulsed = 0;

        for task in due {
            if !task.is_alive() {
                self.shared.remove_task(&task);
                continue;
            }
            if task.is_sync() {
                let outcome = task.pulse(
                    &self.shared.up_time,
                    self.shared.load.as_deref(),
                    self.shared.defer_step_ms,
                );
                if matches!(outcome, PulseOutcome::Ran | PulseOutcome::Panicked) {
                    pulsed += 1;
                }
                self.shared.repeat_schedule(&task);
            } else {
                warn!(task_id = %task.id(), owner = %task.owner(), "async repeating task submitted");
            }
        }
        pulsed
    }

    // ── Cancellation ─────────────────────────────────────────────

    /// Cancel the task with `id`. Returns whether such a task was active.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let task = self.shared.active_tasks.lock().get(&id).cloned();
        match task {
            Some(task) => {
                self.shared.cancel(&task);
                true
            }
            None => false,
        }
    }

    /// Cancel `task`: it will not run again, and an in-flight async pulse
    /// is interrupted.
    pub fn cancel(&self, task: &Arc<Task>) {
        self.shared.cancel(task);
    }

    /// Cancel every active task scheduled by `owner`.
    pub fn cancel_tasks(&self, owner: &Owner) {
        let tasks: Vec<Arc<Task>> = self
            .shared
            .active_tasks
            .lock()
            .values()
            .filter(|t| t.owner() == owner)
            .cloned()
            .collect();
        for task in tasks {
            self.shared.cancel(&task);
        }
    }

    /// Cancel every active task.
    pub fn cancel_all_tasks(&self) {
        let tasks: Vec<Arc<Task>> = self.shared.active_tasks.lock().values().cloned().collect();
        for task in tasks {
            self.shared.cancel(&task);
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Stop accepting tasks, close the task pool to new submissions and
    /// cancel everything. Primary manager only.
    pub fn shutdown(&self) -> Result<(), ShutdownError> {
        if !self.shared.primary {
            return Err(ShutdownError::NotPrimary);
        }
        self.shared.alive.store(false, Ordering::Release);
        // Dropping the pool lets queued jobs finish, then ends its threads.
        let pool = self.shared.pool.write().take();
        drop(pool);
        self.cancel_all_tasks();
        info!(manager = %self.shared.name, "task manager shut down");
        Ok(())
    }

    /// Poll until no async worker is active. Returns `false` if workers
    /// remain after `timeout`.
    pub fn wait_for_async_tasks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.active_workers.lock().is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(
                    workers = self.shared.active_workers.lock().len(),
                    "async tasks still running"
                );
                return false;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Whether the task with `id` is still active (queued, running, or
    /// waiting to be re-armed).
    pub fn is_queued(&self, id: TaskId) -> bool {
        self.shared.active_tasks.lock().contains_key(&id)
    }

    /// The active task with `id`, if any.
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.shared.active_tasks.lock().get(&id).cloned()
    }

    /// Workers currently executing (or waiting to execute) async tasks.
    pub fn active_workers(&self) -> Vec<Arc<Worker>> {
        self.shared.active_workers.lock().values().cloned().collect()
    }

    /// Sync tasks waiting in the queue.
    pub fn pending_tasks(&self) -> Vec<Arc<Task>> {
        self.shared.queue.lock().tasks()
    }

    /// Virtual uptime in milliseconds.
    pub fn up_time(&self) -> u64 {
        self.shared.up_time()
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("name", &self.shared.name)
            .field("primary", &self.shared.primary)
            .field("alive", &self.is_alive())
            .field("up_time", &self.up_time())
            .finish()
    }
}

// Compile-time assertion: the manager is shared across user threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<TaskManager>();
};
