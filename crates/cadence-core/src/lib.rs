//! Core types and traits for the Cadence tick scheduler.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the abstractions shared by the engine and by anything that plugs work
//! into it: identifiers and owner keys, the tick [`Stage`] and its
//! single-writer marker, the [`AsyncManager`] trait, task priorities,
//! and the error types.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod error;
pub mod id;
pub mod manager;
pub mod priority;
pub mod stage;

pub use error::{LockError, RegistryError, ScheduleError, ShutdownError, TickError};
pub use id::{Owner, TaskId};
pub use manager::{AsyncManager, UpdateCounter, WorkUnit, NO_PENDING_UPDATE};
pub use priority::TaskPriority;
pub use stage::{stage_marker, Stage, StageReader, StageWriter};
