//! Fixed-period tick scheduler for Cadence.
//!
//! Provides the [`Scheduler`] that drives registered
//! [`AsyncManager`](cadence_core::AsyncManager)s through the ordered tick
//! stages on a parallel stage pool, the [`SnapshotLock`] that separates
//! readers from the snapshot phase, and the [`TaskManager`] for delayed and
//! repeating sync and async tasks. Supports both lockstep use (call
//! [`Scheduler::tick`] directly) and realtime use through
//! [`RealtimeScheduler`].

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod barrier;
pub mod cancel;
pub mod config;
pub mod descriptor;
pub mod load;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod realtime;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod task_manager;
pub(crate) mod tick_thread;
pub mod worker;

pub use barrier::{StageInterrupter, StageOutcome, StageRunner, StallReport, StalledUnit};
pub use cancel::CancelToken;
pub use config::{
    ConfigError, LockBackoffConfig, SchedulerConfig, TaskManagerConfig, ThresholdRefresh,
    TICK_PERIOD_MS, UPDATE_CAP,
};
pub use descriptor::{StageDescriptor, StageKind};
pub use load::LoadMonitor;
pub use lock::{HeldLock, ReadGuard, SnapshotLock, WriterStall};
pub use metrics::{TickMetrics, TickReport};
pub use queue::TaskPriorityQueue;
pub use realtime::{RealtimeScheduler, ShutdownReport};
pub use registry::SnapshotableList;
pub use scheduler::{Callback, Scheduler};
pub use task::{PulseOutcome, Task, TaskContext};
pub use task_manager::TaskManager;
pub use worker::Worker;
