//! Reusable mock managers.
//!
//! - [`CountingManager`]: counts how often each stage's unit ran.
//! - [`CascadeManager`]: physics produces one update for K passes, then none.
//! - [`AlwaysUpdatingManager`]: every dynamic pass produces updates.
//! - [`SequenceRecorder`]: logs when physics units are requested and finish.
//! - [`StallingManager`]: lighting sleeps for a fixed time.
//! - [`BlockingManager`]: finalize blocks until released.
//! - [`PanickingManager`]: finalize panics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cadence_core::{AsyncManager, UpdateCounter, WorkUnit};
use parking_lot::{Condvar, Mutex};

fn counting_unit(counter: &Arc<AtomicUsize>) -> Option<WorkUnit> {
    let counter = Arc::clone(counter);
    Some(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }))
}

// ── CountingManager ──────────────────────────────────────────────

/// Counts completed units per stage.
#[derive(Default)]
pub struct CountingManager {
    name: String,
    sequence: i32,
    pub start_tick: Arc<AtomicUsize>,
    pub dynamic: Arc<AtomicUsize>,
    pub physics: Arc<AtomicUsize>,
    pub lighting: Arc<AtomicUsize>,
    pub finalize: Arc<AtomicUsize>,
    pub pre_snapshot: Arc<AtomicUsize>,
    pub copy_snapshot: Arc<AtomicUsize>,
}

impl CountingManager {
    pub fn new(name: impl Into<String>, sequence: i32) -> Self {
        Self {
            name: name.into(),
            sequence,
            ..Default::default()
        }
    }

    pub fn count(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl AsyncManager for CountingManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn start_tick(&self, _stage: usize, _delta_ms: u64) -> Option<WorkUnit> {
        counting_unit(&self.start_tick)
    }

    fn dynamic_updates(&self, _sub_seq: i32, _threshold: u64, _u: &UpdateCounter) -> Option<WorkUnit> {
        counting_unit(&self.dynamic)
    }

    fn physics(&self, _sub_seq: i32, _u: &UpdateCounter) -> Option<WorkUnit> {
        counting_unit(&self.physics)
    }

    fn lighting(&self) -> Option<WorkUnit> {
        counting_unit(&self.lighting)
    }

    fn finalize(&self) -> Option<WorkUnit> {
        counting_unit(&self.finalize)
    }

    fn pre_snapshot(&self) -> Option<WorkUnit> {
        counting_unit(&self.pre_snapshot)
    }

    fn copy_snapshot(&self) -> Option<WorkUnit> {
        counting_unit(&self.copy_snapshot)
    }
}

// ── CascadeManager ───────────────────────────────────────────────

/// Each physics pass performs one update while cascades remain.
///
/// Starting with `k` cascades, the convergence loop sees `k` productive
/// rounds and one quiet round.
pub struct CascadeManager {
    remaining: Arc<AtomicU64>,
    pub physics_passes: Arc<AtomicUsize>,
}

impl CascadeManager {
    pub fn new(k: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(k)),
            physics_passes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn passes(&self) -> usize {
        self.physics_passes.load(Ordering::SeqCst)
    }

    /// Queue `k` more cascades for the next tick.
    pub fn rearm(&self, k: u64) {
        self.remaining.store(k, Ordering::SeqCst);
    }
}

impl AsyncManager for CascadeManager {
    fn name(&self) -> &str {
        "cascade"
    }

    fn sequence(&self) -> i32 {
        -1
    }

    fn physics(&self, _sub_seq: i32, updates: &UpdateCounter) -> Option<WorkUnit> {
        let remaining = Arc::clone(&self.remaining);
        let passes = Arc::clone(&self.physics_passes);
        let updates = updates.clone();
        Some(Box::new(move || {
            passes.fetch_add(1, Ordering::SeqCst);
            let fired = remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
                .is_ok();
            if fired {
                updates.add(1);
            }
        }))
    }
}

// ── AlwaysUpdatingManager ────────────────────────────────────────

/// Every dynamic-update pass performs `per_pass` updates. Reports a
/// pending update at time zero.
pub struct AlwaysUpdatingManager {
    per_pass: u64,
    pub thresholds: Arc<Mutex<Vec<u64>>>,
    pub passes: Arc<AtomicUsize>,
}

impl AlwaysUpdatingManager {
    pub fn new(per_pass: u64) -> Self {
        Self {
            per_pass,
            thresholds: Arc::new(Mutex::new(Vec::new())),
            passes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn passes(&self) -> usize {
        self.passes.load(Ordering::SeqCst)
    }
}

impl AsyncManager for AlwaysUpdatingManager {
    fn name(&self) -> &str {
        "always-updating"
    }

    fn sequence(&self) -> i32 {
        -1
    }

    fn first_dynamic_update_time(&self) -> u64 {
        0
    }

    fn dynamic_updates(&self, _sub_seq: i32, threshold: u64, updates: &UpdateCounter) -> Option<WorkUnit> {
        self.thresholds.lock().push(threshold);
        let updates = updates.clone();
        let passes = Arc::clone(&self.passes);
        let n = self.per_pass;
        Some(Box::new(move || {
            passes.fetch_add(1, Ordering::SeqCst);
            updates.add(n);
        }))
    }
}

// ── AdvancingManager ─────────────────────────────────────────────

/// Each dynamic-update pass performs one update and pushes its earliest
/// pending update `step` ms later, so the threshold moves between rounds.
pub struct AdvancingManager {
    step: u64,
    earliest: Arc<AtomicU64>,
    pub thresholds: Arc<Mutex<Vec<u64>>>,
}

impl AdvancingManager {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            step,
            earliest: Arc::new(AtomicU64::new(start)),
            thresholds: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn earliest(&self) -> u64 {
        self.earliest.load(Ordering::SeqCst)
    }
}

impl AsyncManager for AdvancingManager {
    fn name(&self) -> &str {
        "advancing"
    }

    fn sequence(&self) -> i32 {
        -1
    }

    fn first_dynamic_update_time(&self) -> u64 {
        self.earliest.load(Ordering::SeqCst)
    }

    fn dynamic_updates(&self, _sub_seq: i32, threshold: u64, updates: &UpdateCounter) -> Option<WorkUnit> {
        self.thresholds.lock().push(threshold);
        let updates = updates.clone();
        let earliest = Arc::clone(&self.earliest);
        let step = self.step;
        Some(Box::new(move || {
            earliest.fetch_add(step, Ordering::SeqCst);
            updates.add(1);
        }))
    }
}

// ── SequenceRecorder ─────────────────────────────────────────────

/// Whether a unit was handed to the pool or completed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Requested,
    Finished,
}

/// One entry in a [`SequenceRecorder`] log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub manager: String,
    pub sub_seq: i32,
    pub phase: Phase,
}

/// Shared log for managers that record physics unit ordering.
#[derive(Clone, Default)]
pub struct SequenceRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl SequenceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with `sequence` whose physics units sleep for `work`.
    pub fn manager(&self, name: impl Into<String>, sequence: i32, work: Duration) -> RecordingManager {
        RecordingManager {
            name: name.into(),
            sequence,
            work,
            events: Arc::clone(&self.events),
        }
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Position of the first matching event.
    pub fn position(&self, manager: &str, sub_seq: i32, phase: Phase) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|e| e.manager == manager && e.sub_seq == sub_seq && e.phase == phase)
    }
}

/// Manager produced by [`SequenceRecorder::manager`].
pub struct RecordingManager {
    name: String,
    sequence: i32,
    work: Duration,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl AsyncManager for RecordingManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn physics(&self, sub_seq: i32, _u: &UpdateCounter) -> Option<WorkUnit> {
        self.events.lock().push(RecordedEvent {
            manager: self.name.clone(),
            sub_seq,
            phase: Phase::Requested,
        });
        let events = Arc::clone(&self.events);
        let manager = self.name.clone();
        let work = self.work;
        Some(Box::new(move || {
            thread::sleep(work);
            events.lock().push(RecordedEvent {
                manager,
                sub_seq,
                phase: Phase::Finished,
            });
        }))
    }
}

// ── StallingManager ──────────────────────────────────────────────

/// Lighting takes `stall` to complete.
pub struct StallingManager {
    stall: Duration,
}

impl StallingManager {
    pub fn new(stall: Duration) -> Self {
        Self { stall }
    }
}

impl AsyncManager for StallingManager {
    fn name(&self) -> &str {
        "stalling"
    }

    fn sequence(&self) -> i32 {
        -1
    }

    fn lighting(&self) -> Option<WorkUnit> {
        let stall = self.stall;
        Some(Box::new(move || thread::sleep(stall)))
    }
}

// ── BlockingManager ──────────────────────────────────────────────

/// Finalize blocks until [`release`](Self::release) is called.
pub struct BlockingManager {
    sequence: i32,
    gate: Arc<(Mutex<bool>, Condvar)>,
    pub entered: Arc<AtomicUsize>,
}

impl Default for BlockingManager {
    fn default() -> Self {
        Self::with_sequence(-1)
    }
}

impl BlockingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequence(sequence: i32) -> Self {
        Self {
            sequence,
            gate: Arc::new((Mutex::new(false), Condvar::new())),
            entered: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn release(&self) {
        let (open, cvar) = &*self.gate;
        *open.lock() = true;
        cvar.notify_all();
    }

    /// Block until a finalize unit is running, or `timeout` passes.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.entered.load(Ordering::SeqCst) == 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl AsyncManager for BlockingManager {
    fn name(&self) -> &str {
        "blocking"
    }

    fn sequence(&self) -> i32 {
        self.sequence
    }

    fn finalize(&self) -> Option<WorkUnit> {
        let gate = Arc::clone(&self.gate);
        let entered = Arc::clone(&self.entered);
        Some(Box::new(move || {
            entered.fetch_add(1, Ordering::SeqCst);
            let (open, cvar) = &*gate;
            let mut open = open.lock();
            while !*open {
                cvar.wait(&mut open);
            }
        }))
    }
}

// ── PanickingManager ─────────────────────────────────────────────

/// Finalize panics with `message`.
pub struct PanickingManager {
    message: &'static str,
}

impl PanickingManager {
    pub fn new(message: &'static str) -> Self {
        Self { message }
    }
}

impl AsyncManager for PanickingManager {
    fn name(&self) -> &str {
        "panicking"
    }

    fn sequence(&self) -> i32 {
        -1
    }

    fn finalize(&self) -> Option<WorkUnit> {
        let message = self.message;
        Some(Box::new(move || panic!("{message}")))
    }
}
