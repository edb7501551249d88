//! Error types for the Cadence scheduler.
//!
//! Organized by subsystem: tick execution, task scheduling, task manager
//! shutdown, the snapshot registry, and the snapshot lock.

use std::error::Error;
use std::fmt;

use crate::id::Owner;
use crate::stage::Stage;

/// Errors from one scheduler tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickError {
    /// `tick()` was invoked while another tick was still in progress.
    /// No state was touched.
    Reentrant,
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reentrant => write!(f, "tick invoked while a tick is already running"),
        }
    }
}

impl Error for TickError {}

/// Errors from the task scheduling API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    /// The task manager has been shut down and accepts no new tasks.
    ShutDown,
    /// Async tasks may only be scheduled on the primary task manager.
    AsyncNotPermitted,
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutDown => write!(f, "task manager is shut down"),
            Self::AsyncNotPermitted => {
                write!(f, "async tasks may only be scheduled on the primary task manager")
            }
        }
    }
}

impl Error for ScheduleError {}

/// Errors from task manager shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownError {
    /// Only the primary task manager may be shut down.
    NotPrimary,
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPrimary => write!(f, "only the primary task manager can be shut down"),
        }
    }
}

impl Error for ShutdownError {}

/// Errors from the live/stable snapshot registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A registry write was attempted between PreSnapshot and Snapshot.
    SnapshotWindow {
        /// The stage current when the write was attempted.
        stage: Stage,
    },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SnapshotWindow { stage } => {
                write!(f, "registry cannot be modified during stage {stage}")
            }
        }
    }
}

impl Error for RegistryError {}

/// Errors from the snapshot lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockError {
    /// A read unlock was attempted by an owner holding no read lock.
    NotHeld {
        /// The attribution key that attempted the unlock.
        owner: String,
    },
}

impl LockError {
    /// Build a [`LockError::NotHeld`] for an owner key.
    pub fn not_held(owner: &Owner) -> Self {
        Self::NotHeld {
            owner: owner.name().to_string(),
        }
    }
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHeld { owner } => {
                write!(f, "'{owner}' attempted to unlock without holding a read lock")
            }
        }
    }
}

impl Error for LockError {}
