//! Strongly-typed identifiers and the [`Owner`] attribution key.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counter for unique [`TaskId`] allocation.
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a scheduled task.
///
/// Allocated from a monotonic atomic counter via [`TaskId::next`], so ids
/// are never reused, even across task managers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate a fresh, unique task ID. Thread-safe.
    pub fn next() -> Self {
        Self(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TaskId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Attribution key naming whoever scheduled a task or holds a read lock.
///
/// Diagnostics report stalls and long-held locks by owner. Owners compare
/// by name: two `Owner` values built from the same string are the same key.
/// Cloning is cheap (shared `Arc<str>`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Owner(Arc<str>);

impl Owner {
    /// Create an owner key with the given display name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The owner's display name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Owner {
    fn from(v: &str) -> Self {
        Self::new(v)
    }
}

impl From<String> for Owner {
    fn from(v: String) -> Self {
        Self(Arc::from(v))
    }
}
