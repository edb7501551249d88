//! Cadence: a fixed-period tick scheduler with barrier-synchronized stages.
//!
//! This is the top-level facade crate that re-exports the public API from
//! the Cadence sub-crates. For most users, adding `cadence` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//! use cadence::prelude::*;
//!
//! // A manager that advances a counter once per tick.
//! struct Clock(Arc<AtomicU64>);
//! impl AsyncManager for Clock {
//!     fn name(&self) -> &str { "clock" }
//!     fn sequence(&self) -> i32 { -1 }
//!     fn start_tick(&self, stage: usize, _delta_ms: u64) -> Option<WorkUnit> {
//!         let ticks = Arc::clone(&self.0);
//!         (stage == 0).then(|| Box::new(move || { ticks.fetch_add(1, Ordering::SeqCst); }) as WorkUnit)
//!     }
//! }
//!
//! let ticks = Arc::new(AtomicU64::new(0));
//! let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
//! scheduler.add_async_manager(Arc::new(Clock(Arc::clone(&ticks)))).unwrap();
//!
//! // Registry changes take effect at the start of the next tick.
//! let report = scheduler.tick(TICK_PERIOD_MS).unwrap();
//! assert_eq!(report.tick, 1);
//! assert_eq!(ticks.load(Ordering::SeqCst), 1);
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `cadence-core` | IDs, owners, stages, the manager trait, errors |
//! | [`engine`] | `cadence-engine` | Scheduler, snapshot lock, task manager, realtime loop |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types, traits, and IDs (`cadence-core`).
///
/// Contains the [`types::Stage`] enum and its marker, the
/// [`types::AsyncManager`] trait, task priorities, and the error types.
pub use cadence_core as types;

/// The scheduler and its subsystems (`cadence-engine`).
///
/// [`engine::Scheduler`] for lockstep ticking,
/// [`engine::RealtimeScheduler`] for ticking on a background thread, and
/// [`engine::TaskManager`] for delayed and repeating tasks.
pub use cadence_engine as engine;

/// Common imports for typical Cadence usage.
///
/// ```rust
/// use cadence::prelude::*;
/// ```
pub mod prelude {
    // Core types and traits
    pub use cadence_core::{
        AsyncManager, Owner, Stage, StageReader, TaskId, TaskPriority, UpdateCounter, WorkUnit,
        NO_PENDING_UPDATE,
    };

    // Errors
    pub use cadence_core::{LockError, RegistryError, ScheduleError, ShutdownError, TickError};

    // Engine
    pub use cadence_engine::{
        ConfigError, RealtimeScheduler, Scheduler, SchedulerConfig, ShutdownReport, SnapshotLock,
        TaskContext, TaskManager, TickMetrics, TickReport, TICK_PERIOD_MS,
    };
}
