//! The snapshot lock: an attributable N-readers-XOR-1-writer gate.
//!
//! The scheduler holds the writer from the start of the convergence loop
//! until the snapshot copy and core tasks are done. Outside that window,
//! code touching live state takes a read lock under an [`Owner`] key (or a
//! core task name), so a stalled writer can report exactly who is holding
//! it up.
//!
//! # Fairness
//!
//! A waiting writer blocks new readers, so the writer cannot starve.
//! Threads that already hold a read lock may re-acquire it while a writer
//! waits; otherwise reentrant readers would deadlock against the writer.
//! The thread holding the writer may also take read locks, so core tasks
//! running on the tick thread can call into code that reads.
//!
//! # Stage pool bypass
//!
//! Stage pool threads only run while the scheduler itself holds the
//! writer, so their read-lock calls return immediately without touching
//! the gate.

use std::cell::Cell;
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use cadence_core::{LockError, Owner};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::config::LockBackoffConfig;

thread_local! {
    static STAGE_POOL_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Mark the calling thread as a stage pool thread. Called once from the
/// stage pool's start handler.
pub(crate) fn mark_stage_pool_thread() {
    STAGE_POOL_THREAD.with(|c| c.set(true));
}

fn on_stage_pool_thread() -> bool {
    STAGE_POOL_THREAD.with(|c| c.get())
}

// ── Attribution records ──────────────────────────────────────────

#[derive(Debug)]
struct LockInfo {
    count: usize,
    oldest: Instant,
}

#[derive(Debug)]
struct CoreThread {
    name: String,
    count: usize,
}

/// A reader attributed to an owner, reported by
/// [`SnapshotLock::locking_owners`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldLock {
    /// The attribution key.
    pub owner: Owner,
    /// Read locks currently held under this key.
    pub count: usize,
    /// Time since the oldest of those locks was taken.
    pub held_for: Duration,
}

// ── Gate state ───────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    writer: Option<ThreadId>,
    writers_waiting: usize,
    reader_threads: HashMap<ThreadId, usize>,
}

impl GateState {
    fn can_read(&self, me: ThreadId) -> bool {
        if let Some(writer) = self.writer {
            return writer == me;
        }
        self.writers_waiting == 0 || self.reader_threads.contains_key(&me)
    }

    fn is_write_locked(&self) -> bool {
        self.writer.is_some()
    }

    fn add_reader(&mut self, me: ThreadId) {
        self.readers += 1;
        *self.reader_threads.entry(me).or_insert(0) += 1;
    }

    fn remove_reader(&mut self, me: ThreadId) {
        self.readers = self.readers.saturating_sub(1);
        if let Some(n) = self.reader_threads.get_mut(&me) {
            *n -= 1;
            if *n == 0 {
                self.reader_threads.remove(&me);
            }
        }
    }
}

// ── SnapshotLock ─────────────────────────────────────────────────

/// Attributable reader/writer gate guarding the snapshot window.
#[derive(Debug, Default)]
pub struct SnapshotLock {
    gate: Mutex<GateState>,
    changed: Condvar,
    owners: Mutex<HashMap<Owner, LockInfo>>,
    core_tasks: Mutex<HashMap<String, usize>>,
    core_threads: Mutex<HashMap<ThreadId, CoreThread>>,
}

impl SnapshotLock {
    /// Create an unlocked gate.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Writer ───────────────────────────────────────────────────

    /// Try to take the writer, waiting at most `timeout`.
    ///
    /// Returns `false` on timeout. While waiting, new readers are held back.
    pub fn write_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.gate.lock();
        gate.writers_waiting += 1;
        while gate.is_write_locked() || gate.readers > 0 {
            if self.changed.wait_until(&mut gate, deadline).timed_out()
                && (gate.is_write_locked() || gate.readers > 0)
            {
                gate.writers_waiting -= 1;
                drop(gate);
                // Readers held back by this writer may proceed.
                self.changed.notify_all();
                return false;
            }
        }
        gate.writers_waiting -= 1;
        gate.writer = Some(thread::current().id());
        true
    }

    /// Release the writer.
    pub fn write_unlock(&self) {
        let mut gate = self.gate.lock();
        gate.writer = None;
        drop(gate);
        self.changed.notify_all();
    }

    /// Whether the writer is currently held.
    pub fn is_write_locked(&self) -> bool {
        self.gate.lock().is_write_locked()
    }

    /// Take the writer, retrying with growing waits until it succeeds.
    ///
    /// Each failed attempt logs the cumulative stall and the owners that
    /// have held their read locks longer than the report threshold. Past
    /// the core report threshold the core locking threads are logged too.
    pub fn write_lock_with_backoff(&self, config: &LockBackoffConfig) -> WriterStall {
        let start = Instant::now();
        let mut wait = config.initial_wait;
        let mut retries = 0u32;

        while !self.write_lock(wait) {
            retries += 1;
            let stalled = start.elapsed();
            let holders: Vec<String> = self
                .locking_owners(config.report_threshold)
                .into_iter()
                .map(|h| format!("{} x{} ({} ms)", h.owner, h.count, h.held_for.as_millis()))
                .collect();
            warn!(
                elapsed_ms = stalled.as_millis() as u64,
                retries,
                holders = ?holders,
                tasks = ?self.locking_tasks(),
                "unable to acquire snapshot lock"
            );
            if stalled > config.core_report_after {
                for thread in self.core_locking_threads() {
                    warn!(thread = %thread, "core thread holding snapshot read lock");
                }
            }
            wait = wait.mul_f64(config.backoff_factor);
        }

        WriterStall {
            retries,
            stalled: start.elapsed(),
        }
    }

    // ── Owner-attributed readers ─────────────────────────────────

    /// Take a read lock on behalf of `owner`, blocking while a writer holds
    /// or waits.
    pub fn read_lock(&self, owner: &Owner) {
        if on_stage_pool_thread() {
            return;
        }
        self.acquire_read(thread::current().id());
        self.attribute(owner);
    }

    /// Take a read lock on behalf of `owner` only if it is immediately
    /// available.
    pub fn try_read_lock(&self, owner: &Owner) -> bool {
        if on_stage_pool_thread() {
            return true;
        }
        let me = thread::current().id();
        let mut gate = self.gate.lock();
        if !gate.can_read(me) {
            return false;
        }
        gate.add_reader(me);
        drop(gate);
        self.attribute(owner);
        true
    }

    /// Release one read lock held by `owner`.
    pub fn read_unlock(&self, owner: &Owner) -> Result<(), LockError> {
        if on_stage_pool_thread() {
            return Ok(());
        }
        self.release_owner(owner, thread::current().id())
    }

    fn release_owner(&self, owner: &Owner, holder: ThreadId) -> Result<(), LockError> {
        {
            let mut owners = self.owners.lock();
            let Some(info) = owners.get_mut(owner) else {
                return Err(LockError::not_held(owner));
            };
            info.count -= 1;
            if info.count == 0 {
                owners.remove(owner);
            }
        }
        self.release_read(holder);
        Ok(())
    }

    /// Take a read lock attributed by `owner`, released when the guard
    /// drops. The guard may be dropped on another thread.
    pub fn read(&self, owner: &Owner) -> ReadGuard<'_> {
        self.read_lock(owner);
        ReadGuard {
            lock: self,
            holder: Holder::Owner(owner.clone()),
            thread: guard_thread(),
        }
    }

    // ── Core readers ─────────────────────────────────────────────

    /// Take a read lock on behalf of the core task `task_name`.
    pub fn core_read_lock(&self, task_name: &str) {
        if on_stage_pool_thread() {
            return;
        }
        let current = thread::current();
        self.acquire_read(current.id());
        *self.core_tasks.lock().entry(task_name.to_string()).or_insert(0) += 1;
        self.core_threads
            .lock()
            .entry(current.id())
            .or_insert_with(|| CoreThread {
                name: current.name().unwrap_or("<unnamed>").to_string(),
                count: 0,
            })
            .count += 1;
    }

    /// Release one read lock held by the core task `task_name`.
    pub fn core_read_unlock(&self, task_name: &str) -> Result<(), LockError> {
        if on_stage_pool_thread() {
            return Ok(());
        }
        self.release_core(task_name, thread::current().id())
    }

    fn release_core(&self, task_name: &str, holder: ThreadId) -> Result<(), LockError> {
        {
            let mut tasks = self.core_tasks.lock();
            let Some(count) = tasks.get_mut(task_name) else {
                return Err(LockError::NotHeld {
                    owner: task_name.to_string(),
                });
            };
            *count -= 1;
            if *count == 0 {
                tasks.remove(task_name);
            }
        }
        {
            let mut threads = self.core_threads.lock();
            if let Some(t) = threads.get_mut(&holder) {
                t.count -= 1;
                if t.count == 0 {
                    threads.remove(&holder);
                }
            }
        }
        self.release_read(holder);
        Ok(())
    }

    /// Take a core read lock released when the guard drops. The guard may
    /// be dropped on another thread.
    pub fn core_read(&self, task_name: &str) -> ReadGuard<'_> {
        self.core_read_lock(task_name);
        ReadGuard {
            lock: self,
            holder: Holder::Core(task_name.to_string()),
            thread: guard_thread(),
        }
    }

    // ── Diagnostics ──────────────────────────────────────────────

    /// Owners whose oldest read lock has been held for at least
    /// `threshold`, longest first.
    pub fn locking_owners(&self, threshold: Duration) -> Vec<HeldLock> {
        let now = Instant::now();
        let mut held: Vec<HeldLock> = self
            .owners
            .lock()
            .iter()
            .map(|(owner, info)| HeldLock {
                owner: owner.clone(),
                count: info.count,
                held_for: now.saturating_duration_since(info.oldest),
            })
            .filter(|h| h.held_for >= threshold)
            .collect();
        held.sort_by(|a, b| b.held_for.cmp(&a.held_for));
        held
    }

    /// Core task names currently holding read locks, with counts.
    pub fn locking_tasks(&self) -> Vec<(String, usize)> {
        let mut tasks: Vec<(String, usize)> = self
            .core_tasks
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        tasks.sort();
        tasks
    }

    /// Names of threads currently holding core read locks.
    pub fn core_locking_threads(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .core_threads
            .lock()
            .values()
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Number of read locks currently held (bypassing threads excluded).
    pub fn reader_count(&self) -> usize {
        self.gate.lock().readers
    }

    // ── Internals ────────────────────────────────────────────────

    fn acquire_read(&self, me: ThreadId) {
        let mut gate = self.gate.lock();
        while !gate.can_read(me) {
            self.changed.wait(&mut gate);
        }
        gate.add_reader(me);
    }

    fn release_read(&self, holder: ThreadId) {
        let mut gate = self.gate.lock();
        gate.remove_reader(holder);
        let wake = gate.readers == 0;
        drop(gate);
        if wake {
            self.changed.notify_all();
        }
    }

    fn attribute(&self, owner: &Owner) {
        self.owners
            .lock()
            .entry(owner.clone())
            .or_insert_with(|| LockInfo {
                count: 0,
                oldest: Instant::now(),
            })
            .count += 1;
    }
}

/// Outcome of [`SnapshotLock::write_lock_with_backoff`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriterStall {
    /// Failed attempts before the writer was taken.
    pub retries: u32,
    /// Total time spent acquiring.
    pub stalled: Duration,
}

enum Holder {
    Owner(Owner),
    Core(String),
}

/// The acquiring thread, or `None` when the stage pool bypassed the gate.
fn guard_thread() -> Option<ThreadId> {
    (!on_stage_pool_thread()).then(|| thread::current().id())
}

/// RAII read lock from [`SnapshotLock::read`] or
/// [`SnapshotLock::core_read`]. Released on drop, including during unwinding.
pub struct ReadGuard<'a> {
    lock: &'a SnapshotLock,
    holder: Holder,
    thread: Option<ThreadId>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let Some(thread) = self.thread else {
            return;
        };
        let result = match &self.holder {
            Holder::Owner(owner) => self.lock.release_owner(owner, thread),
            Holder::Core(name) => self.lock.release_core(name, thread),
        };
        if let Err(e) = result {
            warn!(error = %e, "read guard released a lock it did not hold");
        }
    }
}

// Compile-time assertion: the lock is shared across the tick thread, the
// task pool and user threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<SnapshotLock>();
};
