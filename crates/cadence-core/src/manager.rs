//! The [`AsyncManager`] trait: a participant in the tick's stages.
//!
//! The scheduler never runs manager code directly. For every stage it asks
//! each registered manager for a [`WorkUnit`]; managers with nothing to do
//! return `None`. Returned units run on the stage pool, concurrently with
//! the units of every other eligible manager, and the stage does not
//! advance until all of them have completed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A unit of work produced by a manager for one stage pass.
pub type WorkUnit = Box<dyn FnOnce() + Send + 'static>;

/// Sentinel for [`AsyncManager::first_dynamic_update_time`]: no dynamic
/// update is pending.
pub const NO_PENDING_UPDATE: u64 = u64::MAX;

/// Shared tally of updates performed during one convergence pass.
///
/// Units add to it as they work; the scheduler [`take`](Self::take)s the
/// total after the pass barrier to decide whether another pass is needed.
#[derive(Clone, Debug, Default)]
pub struct UpdateCounter(Arc<AtomicU64>);

impl UpdateCounter {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` updates.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current total without resetting.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Return the total and reset to zero.
    pub fn take(&self) -> u64 {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// A participant in the tick's barrier-synchronized stages.
///
/// Each stage method is a factory: it is called on the scheduler's tick
/// thread and returns the work to run for that stage, or `None` to sit the
/// stage out. Every method except [`name`](Self::name) and
/// [`sequence`](Self::sequence) defaults to `None`.
///
/// Implementations typically keep their state behind an `Arc` and move a
/// clone of it into each returned unit.
///
/// # Sequences
///
/// Managers whose [`sequence`](Self::sequence) is `>= 0` additionally take
/// part in the sequenced (global) halves of the dynamic-update and physics
/// stages: for sub-sequence `s`, only managers with `sequence() == s` run,
/// and sub-sequences are separated by a full barrier. Sub-sequence `-1`
/// runs every manager.
pub trait AsyncManager: Send + Sync {
    /// Name used in diagnostics and stall reports.
    fn name(&self) -> &str;

    /// Sequence affinity. Negative means "no sequenced pass".
    fn sequence(&self) -> i32;

    /// Virtual time (ms) of the earliest pending dynamic update, or
    /// [`NO_PENDING_UPDATE`].
    fn first_dynamic_update_time(&self) -> u64 {
        NO_PENDING_UPDATE
    }

    /// Start-tick work for start-tick stage `stage` (0 is Stage1).
    fn start_tick(&self, _stage: usize, _delta_ms: u64) -> Option<WorkUnit> {
        None
    }

    /// One dynamic-update pass for sub-sequence `sub_seq`, processing
    /// updates due at or before `threshold`.
    fn dynamic_updates(
        &self,
        _sub_seq: i32,
        _threshold: u64,
        _updates: &UpdateCounter,
    ) -> Option<WorkUnit> {
        None
    }

    /// One physics pass for sub-sequence `sub_seq`.
    fn physics(&self, _sub_seq: i32, _updates: &UpdateCounter) -> Option<WorkUnit> {
        None
    }

    /// Lighting propagation.
    fn lighting(&self) -> Option<WorkUnit> {
        None
    }

    /// Finalize: migrate entities, compact structures.
    fn finalize(&self) -> Option<WorkUnit> {
        None
    }

    /// Monitor-only pre-snapshot work. Must not mutate live state.
    fn pre_snapshot(&self) -> Option<WorkUnit> {
        None
    }

    /// Copy live state into the stable snapshot.
    fn copy_snapshot(&self) -> Option<WorkUnit> {
        None
    }
}
