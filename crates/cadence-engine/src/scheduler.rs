//! The tick algorithm: barrier stages, convergence, snapshot and the
//! deferred callback queues.
//!
//! [`Scheduler::tick`] runs one complete tick on the calling thread. It is
//! normally driven by the realtime loop
//! ([`RealtimeScheduler`](crate::realtime::RealtimeScheduler)), but can be
//! called directly for lockstep use and in tests.
//!
//! # Tick order
//!
//! ```text
//! TickStart   input hook, commit manager registry, task heartbeat
//! Stage1      start_tick(0)
//! Stage2+     start_tick(1..n)
//! ── snapshot writer acquired (backoff) ──
//! loop        { dynamic updates pass; physics pass } until no updates or cap
//! Lighting
//! Finalize
//! PreSnapshot
//! Snapshot
//! core tasks
//! ── writer released ──
//! ```

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cadence_core::{
    stage_marker, AsyncManager, Owner, RegistryError, Stage, StageReader, StageWriter, TickError,
    UpdateCounter,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::barrier::{panic_message, StageInterrupter, StageRunner, StallReport};
use crate::config::{ConfigError, SchedulerConfig, ThresholdRefresh};
use crate::descriptor::StageDescriptor;
use crate::load::LoadMonitor;
use crate::lock::SnapshotLock;
use crate::metrics::{TickMetrics, TickReport};
use crate::registry::SnapshotableList;
use crate::task_manager::TaskManager;

/// A deferred callback run by the scheduler.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

type InputHook = Box<dyn FnMut(u64) + Send + 'static>;

/// Resets the tick state on every exit path of [`Scheduler::tick`].
struct TickGuard<'a> {
    ticking: &'a AtomicBool,
    stage: &'a StageWriter,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.stage.set(Stage::TickStart);
        self.ticking.store(false, Ordering::Release);
    }
}

/// Releases the snapshot writer on every exit path.
struct WriterGuard<'a>(&'a SnapshotLock);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.write_unlock();
    }
}

/// Fixed-stage tick scheduler over a dynamic set of async managers.
pub struct Scheduler {
    config: SchedulerConfig,
    stage: StageWriter,
    stage_reader: StageReader,
    managers: SnapshotableList<Arc<dyn AsyncManager>>,
    lock: Arc<SnapshotLock>,
    runner: StageRunner,
    task_manager: TaskManager,
    load: Arc<LoadMonitor>,
    setup_complete: Arc<AtomicBool>,
    ticking: AtomicBool,
    tick_thread_exited: AtomicBool,
    updates: UpdateCounter,
    core_tx: Sender<Callback>,
    core_rx: Receiver<Callback>,
    final_tasks: Mutex<VecDeque<Callback>>,
    last_tick_tasks: Mutex<VecDeque<Callback>>,
    input_hook: Mutex<Option<InputHook>>,
    tick_count: AtomicU64,
    lock_stall_retries: AtomicU64,
    update_cap_warnings: AtomicU64,
    core_task_panics: AtomicU64,
}

impl Scheduler {
    /// Validate `config` and build the stage pool and primary task manager.
    pub fn new(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (stage, stage_reader) = stage_marker();
        let load = Arc::new(LoadMonitor::new(config.tick_period_ms));
        let setup_complete = Arc::new(AtomicBool::new(false));
        let runner = StageRunner::new(
            config.resolved_stage_workers(),
            config.stall_timeout(),
            Arc::clone(&setup_complete),
        )?;
        let task_manager = TaskManager::primary(&config, Some(Arc::clone(&load)))?;
        let (core_tx, core_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            managers: SnapshotableList::new(stage_reader.clone()),
            config,
            stage,
            stage_reader,
            lock: Arc::new(SnapshotLock::new()),
            runner,
            task_manager,
            load,
            setup_complete,
            ticking: AtomicBool::new(false),
            tick_thread_exited: AtomicBool::new(false),
            updates: UpdateCounter::new(),
            core_tx,
            core_rx,
            final_tasks: Mutex::new(VecDeque::new()),
            last_tick_tasks: Mutex::new(VecDeque::new()),
            input_hook: Mutex::new(None),
            tick_count: AtomicU64::new(0),
            lock_stall_retries: AtomicU64::new(0),
            update_cap_warnings: AtomicU64::new(0),
            core_task_panics: AtomicU64::new(0),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Read-only view of the current stage.
    pub fn stage(&self) -> StageReader {
        self.stage_reader.clone()
    }

    /// The snapshot lock.
    pub fn snapshot_lock(&self) -> &Arc<SnapshotLock> {
        &self.lock
    }

    /// The primary task manager.
    pub fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }

    /// Tick timing and overload state.
    pub fn load(&self) -> &Arc<LoadMonitor> {
        &self.load
    }

    /// A handle that abandons the tick thread's current sub-sequence wait.
    /// The tick itself carries on with the next sub-sequence.
    pub fn interrupter(&self) -> StageInterrupter {
        self.runner.interrupter()
    }

    /// The most recent stage stall, with the tick thread's backtrace.
    pub fn last_stall(&self) -> Option<StallReport> {
        self.runner.last_stall()
    }

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::Acquire)
    }

    /// Milliseconds since the current tick started.
    pub fn tick_time_ms(&self) -> u64 {
        self.load.tick_time_ms()
    }

    /// Milliseconds left in the current tick; negative on overrun.
    pub fn remaining_tick_time_ms(&self) -> i64 {
        self.load.remaining_tick_time_ms()
    }

    /// Whether the scheduler is overloaded. Sticky until the next tick.
    pub fn is_server_overloaded(&self) -> bool {
        self.load.is_overloaded()
    }

    /// Enable stall logging. Before this, stage stalls are waited out
    /// silently.
    pub fn set_setup_complete(&self) {
        self.setup_complete.store(true, Ordering::Release);
    }

    /// Whether [`set_setup_complete`](Self::set_setup_complete) was called.
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.load(Ordering::Acquire)
    }

    /// Install a hook called with the tick delta at the start of every
    /// tick, before anything else.
    pub fn set_input_hook(&self, hook: impl FnMut(u64) + Send + 'static) {
        *self.input_hook.lock() = Some(Box::new(hook));
    }

    // ── Manager registry ─────────────────────────────────────────

    /// Register a manager. Takes effect at the start of the next tick.
    pub fn add_async_manager(&self, manager: Arc<dyn AsyncManager>) -> Result<(), RegistryError> {
        self.managers.add(manager)
    }

    /// Deregister a manager. Takes effect at the start of the next tick.
    /// Returns whether it was registered.
    pub fn remove_async_manager(
        &self,
        manager: &Arc<dyn AsyncManager>,
    ) -> Result<bool, RegistryError> {
        let target = Arc::as_ptr(manager) as *const ();
        self.managers
            .remove_where(|m| Arc::as_ptr(m) as *const () == target)
    }

    /// The managers taking part in the current tick.
    pub fn async_managers(&self) -> Arc<Vec<Arc<dyn AsyncManager>>> {
        self.managers.get()
    }

    // ── Tick ─────────────────────────────────────────────────────

    /// Run one tick of `delta_ms`.
    ///
    /// Returns [`TickError::Reentrant`] without touching any state if a
    /// tick is already running. An interrupted stage wait is counted in
    /// [`TickMetrics::interrupted_waits`] and the tick runs to the end. The
    /// snapshot writer is released on every path.
    pub fn tick(&self, delta_ms: u64) -> Result<TickReport, TickError> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("attempt made to start a tick before the previous one ended");
            return Err(TickError::Reentrant);
        }
        let _tick = TickGuard {
            ticking: &self.ticking,
            stage: &self.stage,
        };

        let start = Instant::now();
        let mut metrics = TickMetrics::default();

        self.stage.set(Stage::TickStart);
        self.pump_input(delta_ms);
        self.managers.copy_snapshot();
        metrics.tasks_pulsed = self.task_manager.heartbeat(delta_ms);
        let managers = self.managers.get();

        for i in 0..self.config.start_tick_stages {
            self.run_stage(&managers, StageDescriptor::start_tick(i, delta_ms), &mut metrics);
        }

        let stall = self.lock.write_lock_with_backoff(&self.config.lock_backoff);
        let writer = WriterGuard(&self.lock);
        metrics.lock_stall_ms = stall.stalled.as_millis() as u64;
        self.lock_stall_retries
            .fetch_add(u64::from(stall.retries), Ordering::Relaxed);

        self.converge(&managers, &mut metrics);
        self.run_stage(&managers, StageDescriptor::lighting(), &mut metrics);
        self.run_stage(&managers, StageDescriptor::finalize(), &mut metrics);
        self.copy_snapshot(&managers, &mut metrics);
        metrics.core_tasks_run = self.run_core_tasks();
        self.stage.set(Stage::TickStart);
        drop(writer);

        let tick = self.tick_count.fetch_add(1, Ordering::AcqRel) + 1;
        metrics.total_us = start.elapsed().as_micros() as u64;
        self.fill_counters(&mut metrics);
        Ok(TickReport {
            tick,
            up_time_ms: self.task_manager.up_time(),
            metrics,
        })
    }

    fn pump_input(&self, delta_ms: u64) {
        let mut hook = self.input_hook.lock();
        if let Some(hook) = hook.as_mut() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(delta_ms))) {
                error!(panic = %panic_message(payload.as_ref()), "input hook panicked");
            }
        }
    }

    fn run_stage(
        &self,
        managers: &[Arc<dyn AsyncManager>],
        descriptor: StageDescriptor,
        metrics: &mut TickMetrics,
    ) {
        let outcome = self
            .runner
            .run_stage(managers, &descriptor, &self.stage, &self.updates);
        metrics.interrupted_waits += outcome.interrupted_waits;
        metrics
            .stage_us
            .push((descriptor.name(), outcome.elapsed.as_micros() as u64));
    }

    /// Earliest pending dynamic update across managers plus one period.
    fn dynamic_threshold(&self, managers: &[Arc<dyn AsyncManager>]) -> u64 {
        let period = self.config.tick_period_ms;
        let end_of_the_world = u64::MAX - period;
        let earliest = managers
            .iter()
            .map(|m| m.first_dynamic_update_time())
            .fold(end_of_the_world, u64::min);
        earliest + period - 1
    }

    /// Alternate dynamic-update and physics passes until a round produces
    /// no updates or the cumulative total reaches the cap.
    fn converge(
        &self,
        managers: &[Arc<dyn AsyncManager>],
        metrics: &mut TickMetrics,
    ) {
        let cap = self.config.update_cap;
        let local = self.config.local_sequences;
        let mut total = 0u64;
        let mut threshold = self.dynamic_threshold(managers);
        self.updates.take();

        'converge: loop {
            let mut progressed = false;
            metrics.convergence_passes += 1;

            if self.config.dynamic_updates {
                if self.config.threshold_refresh == ThresholdRefresh::PerPass {
                    threshold = self.dynamic_threshold(managers);
                }
                self.run_stage(managers, StageDescriptor::dynamic_updates(threshold, local), metrics);
                let n = self.updates.take();
                metrics.dynamic_updates += n;
                total += n;
                progressed |= n > 0;
                if total >= cap {
                    break 'converge;
                }
            }

            if self.config.block_physics {
                self.run_stage(managers, StageDescriptor::physics(local), metrics);
                let n = self.updates.take();
                metrics.physics_updates += n;
                total += n;
                progressed |= n > 0;
                if total >= cap {
                    break 'converge;
                }
            }

            if !progressed {
                break;
            }
        }

        if total >= cap {
            metrics.update_cap_hit = true;
            self.update_cap_warnings.fetch_add(1, Ordering::Relaxed);
            warn!(
                total,
                cap,
                dynamic = metrics.dynamic_updates,
                physics = metrics.physics_updates,
                "block updates per tick exceeded the threshold"
            );
        }
    }

    fn copy_snapshot(&self, managers: &[Arc<dyn AsyncManager>], metrics: &mut TickMetrics) {
        self.run_stage(managers, StageDescriptor::pre_snapshot(), metrics);
        self.run_stage(managers, StageDescriptor::copy_snapshot(), metrics);
    }

    /// Commit the registry, then run PreSnapshot and Snapshot under the
    /// writer. Used by the shutdown sequence outside of a tick.
    pub fn copy_snapshot_with_lock(&self) -> Result<(), TickError> {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TickError::Reentrant);
        }
        let _tick = TickGuard {
            ticking: &self.ticking,
            stage: &self.stage,
        };
        self.managers.copy_snapshot();
        let managers = self.managers.get();
        let stall = self.lock.write_lock_with_backoff(&self.config.lock_backoff);
        let _writer = WriterGuard(&self.lock);
        self.lock_stall_retries
            .fetch_add(u64::from(stall.retries), Ordering::Relaxed);
        let mut metrics = TickMetrics::default();
        self.copy_snapshot(&managers, &mut metrics);
        Ok(())
    }

    fn fill_counters(&self, metrics: &mut TickMetrics) {
        metrics.stall_warnings = self.runner.stall_warnings();
        metrics.unit_panics = self.runner.unit_panics();
        metrics.lock_stall_retries = self.lock_stall_retries.load(Ordering::Relaxed);
        metrics.update_cap_warnings = self.update_cap_warnings.load(Ordering::Relaxed);
        metrics.core_task_panics = self.core_task_panics.load(Ordering::Relaxed);
    }

    // ── Deferred callbacks ───────────────────────────────────────

    /// Queue `task` to run on the tick thread right after the snapshot copy
    /// of the current (or next) tick, while the writer is still held.
    /// Tasks run in submission order.
    pub fn schedule_core_task(&self, task: impl FnOnce() + Send + 'static) {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.core_tx.send(Box::new(task));
    }

    fn run_core_tasks(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.core_rx.try_recv() {
            ran += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                self.core_task_panics.fetch_add(1, Ordering::Relaxed);
                error!(panic = %panic_message(payload.as_ref()), "core task panicked");
            }
        }
        ran
    }

    /// Queue `task` to run at the very end of shutdown. If the tick thread
    /// has already exited, the queue is drained immediately.
    pub fn submit_final_task(&self, task: impl FnOnce() + Send + 'static, add_to_start: bool) {
        {
            let mut queue = self.final_tasks.lock();
            if add_to_start {
                queue.push_front(Box::new(task));
            } else {
                queue.push_back(Box::new(task));
            }
        }
        if self.tick_thread_exited.load(Ordering::Acquire) {
            warn!("final task submitted after the tick thread had shut down");
            self.run_final_tasks();
        }
    }

    /// Queue `task` to run once async tasks have drained during shutdown.
    /// If the tick thread has already exited, the queue is drained
    /// immediately.
    pub fn submit_last_tick_task(&self, task: impl FnOnce() + Send + 'static) {
        self.last_tick_tasks.lock().push_back(Box::new(task));
        if self.tick_thread_exited.load(Ordering::Acquire) {
            warn!("last tick task submitted after the tick thread had shut down");
            self.run_last_tick_tasks();
        }
    }

    /// Drain the final-task queue on the calling thread.
    pub fn run_final_tasks(&self) -> usize {
        Self::drain(&self.final_tasks, "final task")
    }

    /// Drain the last-tick-task queue on the calling thread.
    pub fn run_last_tick_tasks(&self) -> usize {
        Self::drain(&self.last_tick_tasks, "last tick task")
    }

    fn drain(queue: &Mutex<VecDeque<Callback>>, what: &str) -> usize {
        let mut ran = 0;
        loop {
            // Lock released before running so tasks may submit more.
            let Some(task) = queue.lock().pop_front() else {
                return ran;
            };
            ran += 1;
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!(panic = %panic_message(payload.as_ref()), "{what} panicked");
            }
        }
    }

    pub(crate) fn mark_tick_thread_exited(&self) {
        self.tick_thread_exited.store(true, Ordering::Release);
    }

    // ── Safe execution ───────────────────────────────────────────

    /// Run `task` under a read lock attributed to `owner`. A panic is
    /// logged and swallowed; the lock is released on every path.
    pub fn safe_run(&self, owner: &Owner, task: impl FnOnce()) {
        let _guard = self.lock.read(owner);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            info!(owner = %owner, panic = %panic_message(payload.as_ref()), "exception thrown when executing task");
        }
    }

    /// Like [`safe_run`](Self::safe_run), returning the task's value or
    /// `None` if it panicked.
    pub fn safe_call<T>(&self, owner: &Owner, task: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.lock.read(owner);
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(v) => Some(v),
            Err(payload) => {
                info!(owner = %owner, panic = %panic_message(payload.as_ref()), "exception thrown when executing task");
                None
            }
        }
    }

    /// Run `task` under a core read lock attributed to `task_name`.
    pub fn core_safe_run(&self, task_name: &str, task: impl FnOnce()) {
        let _guard = self.lock.core_read(task_name);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            info!(task = task_name, panic = %panic_message(payload.as_ref()), "exception thrown when executing core task");
        }
    }

    /// Like [`core_safe_run`](Self::core_safe_run), returning the task's
    /// value or `None` if it panicked.
    pub fn core_safe_call<T>(&self, task_name: &str, task: impl FnOnce() -> T) -> Option<T> {
        let _guard = self.lock.core_read(task_name);
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(v) => Some(v),
            Err(payload) => {
                info!(task = task_name, panic = %panic_message(payload.as_ref()), "exception thrown when executing core task");
                None
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("stage", &self.stage_reader.current())
            .field("tick_count", &self.tick_count())
            .field("managers", &self.managers.get().len())
            .finish()
    }
}

// Compile-time assertion: the scheduler is shared between the tick thread
// and user threads behind an `Arc`.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Scheduler>();
};
