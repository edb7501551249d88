//! Tick stages and the single-writer current-stage marker.
//!
//! Exactly one [`Stage`] is current at any instant. The tick thread owns
//! the only [`StageWriter`]; every other thread observes the stage through
//! a cloneable [`StageReader`]. Readers use the marker for instrumentation
//! and for guarding stage-restricted operations (for example, rejecting
//! registry writes during the snapshot window).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// A named phase of one tick.
///
/// Variants are listed in execution order. The `Global*` variants are the
/// cross-manager (sequenced) halves of the dynamic-update and physics
/// stages; the plain variants are the per-manager (sub-sequence `-1`)
/// halves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    /// Between ticks, and while the tick is pumping input and tasks.
    TickStart = 0,
    /// First start-tick stage. The API is fully open.
    Stage1 = 1,
    /// Any of the follow-up start-tick stages.
    Stage2Plus = 2,
    /// Sequenced dynamic block updates.
    GlobalDynamicBlocks = 3,
    /// Per-manager dynamic block updates.
    DynamicBlocks = 4,
    /// Sequenced physics.
    GlobalPhysics = 5,
    /// Per-manager physics.
    Physics = 6,
    /// Lighting propagation.
    Lighting = 7,
    /// Entities migrate between partitions; structures compact.
    Finalize = 8,
    /// Monitor-only stage: data is stable and no writes are permitted.
    PreSnapshot = 9,
    /// Live state is copied to the stable snapshot. No reads permitted.
    Snapshot = 10,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 11] = [
        Stage::TickStart,
        Stage::Stage1,
        Stage::Stage2Plus,
        Stage::GlobalDynamicBlocks,
        Stage::DynamicBlocks,
        Stage::GlobalPhysics,
        Stage::Physics,
        Stage::Lighting,
        Stage::Finalize,
        Stage::PreSnapshot,
        Stage::Snapshot,
    ];

    /// Upper-case name used in log output.
    pub const fn name(self) -> &'static str {
        match self {
            Self::TickStart => "TICKSTART",
            Self::Stage1 => "STAGE1",
            Self::Stage2Plus => "STAGE2P",
            Self::GlobalDynamicBlocks => "GLOBAL_DYNAMIC_BLOCKS",
            Self::DynamicBlocks => "DYNAMIC_BLOCKS",
            Self::GlobalPhysics => "GLOBAL_PHYSICS",
            Self::Physics => "PHYSICS",
            Self::Lighting => "LIGHTING",
            Self::Finalize => "FINALIZE",
            Self::PreSnapshot => "PRESNAPSHOT",
            Self::Snapshot => "SNAPSHOT",
        }
    }

    /// Whether live state may not be mutated during this stage.
    pub const fn is_snapshot_window(self) -> bool {
        matches!(self, Self::PreSnapshot | Self::Snapshot)
    }

    fn from_u8(v: u8) -> Self {
        Self::ALL
            .get(v as usize)
            .copied()
            .unwrap_or(Self::TickStart)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Create a linked writer/reader pair, initialised to [`Stage::TickStart`].
pub fn stage_marker() -> (StageWriter, StageReader) {
    let cell = Arc::new(AtomicU8::new(Stage::TickStart as u8));
    (
        StageWriter {
            cell: Arc::clone(&cell),
        },
        StageReader { cell },
    )
}

/// The unique write end of the stage marker.
///
/// Deliberately neither `Clone` nor constructible outside
/// [`stage_marker`], so only its owner (the scheduler) transitions stages.
pub struct StageWriter {
    cell: Arc<AtomicU8>,
}

impl StageWriter {
    /// Transition to `stage`.
    pub fn set(&self, stage: Stage) {
        self.cell.store(stage as u8, Ordering::Release);
    }

    /// The stage most recently set.
    pub fn current(&self) -> Stage {
        Stage::from_u8(self.cell.load(Ordering::Acquire))
    }

    /// A new read handle onto this marker.
    pub fn reader(&self) -> StageReader {
        StageReader {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl fmt::Debug for StageWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StageWriter").field(&self.current()).finish()
    }
}

/// Read-only view of the current stage. Cheap to clone and share.
#[derive(Clone)]
pub struct StageReader {
    cell: Arc<AtomicU8>,
}

impl StageReader {
    /// The current stage.
    pub fn current(&self) -> Stage {
        Stage::from_u8(self.cell.load(Ordering::Acquire))
    }

    /// Whether the current stage is one of `allowed`.
    pub fn is_any_of(&self, allowed: &[Stage]) -> bool {
        allowed.contains(&self.current())
    }
}

impl fmt::Debug for StageReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StageReader").field(&self.current()).finish()
    }
}

// Compile-time assertion: readers must be shareable across threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<StageReader>();
    assert::<StageWriter>();
};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn marker_starts_at_tick_start() {
        let (writer, reader) = stage_marker();
        assert_eq!(writer.current(), Stage::TickStart);
        assert_eq!(reader.current(), Stage::TickStart);
    }

    #[test]
    fn readers_observe_writer_transitions() {
        let (writer, reader) = stage_marker();
        let second = writer.reader();
        writer.set(Stage::Lighting);
        assert_eq!(reader.current(), Stage::Lighting);
        assert_eq!(second.current(), Stage::Lighting);
        assert!(reader.is_any_of(&[Stage::Finalize, Stage::Lighting]));
        assert!(!reader.is_any_of(&[Stage::Finalize]));
    }

    #[test]
    fn every_stage_round_trips_through_the_marker() {
        let (writer, reader) = stage_marker();
        for stage in Stage::ALL {
            writer.set(stage);
            assert_eq!(reader.current(), stage);
        }
    }

    proptest! {
        #[test]
        fn reader_sees_the_last_stage_written(
            writes in proptest::collection::vec(0..Stage::ALL.len(), 1..32),
            allowed in proptest::collection::vec(0..Stage::ALL.len(), 0..4),
        ) {
            let (writer, reader) = stage_marker();
            for &i in &writes {
                writer.set(Stage::ALL[i]);
            }
            let last = Stage::ALL[*writes.last().unwrap()];
            prop_assert_eq!(reader.current(), last);
            let allowed: Vec<Stage> = allowed.into_iter().map(|i| Stage::ALL[i]).collect();
            prop_assert_eq!(reader.is_any_of(&allowed), allowed.contains(&last));
        }
    }

    #[test]
    fn snapshot_window_covers_presnapshot_and_snapshot_only() {
        let window: Vec<Stage> = Stage::ALL
            .into_iter()
            .filter(|s| s.is_snapshot_window())
            .collect();
        assert_eq!(window, vec![Stage::PreSnapshot, Stage::Snapshot]);
    }
}
