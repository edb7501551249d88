//! Test utilities and mock managers for Cadence development.
//!
//! Provides [`AsyncManager`](cadence_core::AsyncManager) implementations
//! with observable behaviour for scheduler and barrier tests. See
//! [`fixtures`] for the individual mocks.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

pub use fixtures::{
    AdvancingManager, AlwaysUpdatingManager, BlockingManager, CascadeManager, CountingManager, PanickingManager,
    Phase, RecordedEvent, RecordingManager, SequenceRecorder, StallingManager,
};
