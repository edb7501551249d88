//! Stage descriptors: what a stage asks of each manager, and over which
//! sub-sequences.

use cadence_core::{AsyncManager, Stage, UpdateCounter, WorkUnit};

/// The kind of work a stage performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    /// Start-tick stage `stage` (0 is Stage1, the rest are Stage2+).
    StartTick {
        /// Index of the start-tick stage.
        stage: usize,
        /// Tick delta in milliseconds.
        delta_ms: u64,
    },
    /// One dynamic-update pass over updates due at or before `threshold`.
    DynamicUpdates {
        /// Virtual-time threshold in milliseconds.
        threshold: u64,
    },
    /// One physics pass.
    Physics,
    /// Lighting propagation.
    Lighting,
    /// Finalize.
    Finalize,
    /// Monitor-only pre-snapshot.
    PreSnapshot,
    /// Live-to-stable snapshot copy.
    CopySnapshot,
}

/// A stage kind plus the closed sub-sequence range `[min, max]` it runs.
///
/// Sub-sequence `-1` runs every manager; `s >= 0` runs only the managers
/// whose [`sequence()`](AsyncManager::sequence) equals `s`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageDescriptor {
    kind: StageKind,
    min: i32,
    max: i32,
}

impl StageDescriptor {
    /// Start-tick stage `stage`, all managers at once.
    pub fn start_tick(stage: usize, delta_ms: u64) -> Self {
        Self::single(StageKind::StartTick { stage, delta_ms })
    }

    /// Dynamic updates: the all-managers pass, then `local_sequences`
    /// sequenced passes.
    pub fn dynamic_updates(threshold: u64, local_sequences: i32) -> Self {
        Self {
            kind: StageKind::DynamicUpdates { threshold },
            min: -1,
            max: local_sequences - 1,
        }
    }

    /// Physics: the all-managers pass, then `local_sequences` sequenced
    /// passes.
    pub fn physics(local_sequences: i32) -> Self {
        Self {
            kind: StageKind::Physics,
            min: -1,
            max: local_sequences - 1,
        }
    }

    /// Lighting, all managers at once.
    pub fn lighting() -> Self {
        Self::single(StageKind::Lighting)
    }

    /// Finalize, all managers at once.
    pub fn finalize() -> Self {
        Self::single(StageKind::Finalize)
    }

    /// Pre-snapshot, all managers at once.
    pub fn pre_snapshot() -> Self {
        Self::single(StageKind::PreSnapshot)
    }

    /// Snapshot copy, all managers at once.
    pub fn copy_snapshot() -> Self {
        Self::single(StageKind::CopySnapshot)
    }

    fn single(kind: StageKind) -> Self {
        Self {
            kind,
            min: -1,
            max: -1,
        }
    }

    /// Replace the sub-sequence range. An empty range (`min > max`) runs
    /// nothing.
    pub fn with_range(mut self, min: i32, max: i32) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// The stage kind.
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// First sub-sequence.
    pub fn min_sequence(&self) -> i32 {
        self.min
    }

    /// Last sub-sequence, inclusive.
    pub fn max_sequence(&self) -> i32 {
        self.max
    }

    /// Stage marker value while running sub-sequence `-1`.
    pub fn local_stage(&self) -> Stage {
        match self.kind {
            StageKind::StartTick { stage: 0, .. } => Stage::Stage1,
            StageKind::StartTick { .. } => Stage::Stage2Plus,
            StageKind::DynamicUpdates { .. } => Stage::DynamicBlocks,
            StageKind::Physics => Stage::Physics,
            StageKind::Lighting => Stage::Lighting,
            StageKind::Finalize => Stage::Finalize,
            StageKind::PreSnapshot => Stage::PreSnapshot,
            StageKind::CopySnapshot => Stage::Snapshot,
        }
    }

    /// Stage marker value while running a sub-sequence `>= 0`.
    pub fn global_stage(&self) -> Stage {
        match self.kind {
            StageKind::DynamicUpdates { .. } => Stage::GlobalDynamicBlocks,
            StageKind::Physics => Stage::GlobalPhysics,
            _ => self.local_stage(),
        }
    }

    /// Stage marker value for sub-sequence `sub_seq`.
    pub fn stage_for(&self, sub_seq: i32) -> Stage {
        if sub_seq == -1 {
            self.local_stage()
        } else {
            self.global_stage()
        }
    }

    /// Human-readable stage name for diagnostics.
    pub fn name(&self) -> String {
        match self.kind {
            StageKind::StartTick { stage, .. } => format!("Stage {stage}"),
            StageKind::DynamicUpdates { .. } => "Dynamic Blocks".into(),
            StageKind::Physics => "Physics".into(),
            StageKind::Lighting => "Lighting".into(),
            StageKind::Finalize => "Finalize".into(),
            StageKind::PreSnapshot => "Pre-snapshot".into(),
            StageKind::CopySnapshot => "Copy-snapshot".into(),
        }
    }

    /// Ask `manager` for its unit of work for sub-sequence `sub_seq`.
    pub fn unit_for(
        &self,
        manager: &dyn AsyncManager,
        sub_seq: i32,
        updates: &UpdateCounter,
    ) -> Option<WorkUnit> {
        match self.kind {
            StageKind::StartTick { stage, delta_ms } => manager.start_tick(stage, delta_ms),
            StageKind::DynamicUpdates { threshold } => {
                manager.dynamic_updates(sub_seq, threshold, updates)
            }
            StageKind::Physics => manager.physics(sub_seq, updates),
            StageKind::Lighting => manager.lighting(),
            StageKind::Finalize => manager.finalize(),
            StageKind::PreSnapshot => manager.pre_snapshot(),
            StageKind::CopySnapshot => manager.copy_snapshot(),
        }
    }
}
