//! Double-buffered (live/stable) list with a once-per-tick commit.
//!
//! Writers mutate the live list and see their change immediately through
//! [`live()`](SnapshotableList::live). Everyone else reads the stable view
//! from [`get()`](SnapshotableList::get), which only changes when the tick
//! thread calls [`copy_snapshot()`](SnapshotableList::copy_snapshot).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cadence_core::{RegistryError, StageReader};
use parking_lot::{Mutex, RwLock};

/// A list with a live view for writers and a stable published view.
pub struct SnapshotableList<T> {
    live: Mutex<Vec<T>>,
    stable: RwLock<Arc<Vec<T>>>,
    dirty: AtomicBool,
    stage: StageReader,
}

impl<T: Clone> SnapshotableList<T> {
    /// Create an empty list guarded by `stage`: writes are rejected while
    /// the stage is in the snapshot window.
    pub fn new(stage: StageReader) -> Self {
        Self {
            live: Mutex::new(Vec::new()),
            stable: RwLock::new(Arc::new(Vec::new())),
            dirty: AtomicBool::new(false),
            stage,
        }
    }

    /// Append to the live list.
    pub fn add(&self, item: T) -> Result<(), RegistryError> {
        let mut live = self.live.lock();
        self.check_writable()?;
        live.push(item);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove the first live element matching `pred`. Returns whether one
    /// was removed.
    pub fn remove_where(&self, mut pred: impl FnMut(&T) -> bool) -> Result<bool, RegistryError> {
        let mut live = self.live.lock();
        self.check_writable()?;
        match live.iter().position(|t| pred(t)) {
            Some(i) => {
                live.remove(i);
                self.dirty.store(true, Ordering::Release);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A copy of the live list.
    pub fn live(&self) -> Vec<T> {
        self.live.lock().clone()
    }

    /// The stable view published by the last commit.
    pub fn get(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.stable.read())
    }

    /// Whether the live list has changed since the last commit.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Publish the live list as the new stable view. No-op when clean.
    pub fn copy_snapshot(&self) {
        let live = self.live.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.stable.write() = Arc::new(live.clone());
    }

    // Callers hold the live lock, so a write either lands before the
    // commit or sees the stage the tick set before committing.
    fn check_writable(&self) -> Result<(), RegistryError> {
        let stage = self.stage.current();
        if stage.is_snapshot_window() {
            return Err(RegistryError::SnapshotWindow { stage });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{stage_marker, Stage};

    #[test]
    fn writes_are_live_until_committed() {
        let (_writer, reader) = stage_marker();
        let list = SnapshotableList::new(reader);
        list.add(1).unwrap();
        list.add(2).unwrap();
        assert_eq!(list.live(), vec![1, 2]);
        assert!(list.get().is_empty());
        assert!(list.is_dirty());

        list.copy_snapshot();
        assert_eq!(*list.get(), vec![1, 2]);
        assert!(!list.is_dirty());

        assert!(list.remove_where(|v| *v == 1).unwrap());
        assert!(!list.remove_where(|v| *v == 9).unwrap());
        assert_eq!(*list.get(), vec![1, 2]);
        list.copy_snapshot();
        assert_eq!(*list.get(), vec![2]);
    }

    #[test]
    fn stable_view_held_by_reader_survives_commit() {
        let (_writer, reader) = stage_marker();
        let list = SnapshotableList::new(reader);
        list.add("a").unwrap();
        list.copy_snapshot();
        let held = list.get();
        list.add("b").unwrap();
        list.copy_snapshot();
        assert_eq!(*held, vec!["a"]);
        assert_eq!(*list.get(), vec!["a", "b"]);
    }

    #[test]
    fn writes_rejected_in_snapshot_window() {
        let (writer, reader) = stage_marker();
        let list = SnapshotableList::new(reader);
        for stage in [Stage::PreSnapshot, Stage::Snapshot] {
            writer.set(stage);
            assert_eq!(list.add(1), Err(RegistryError::SnapshotWindow { stage }));
            assert!(list.remove_where(|_| true).is_err());
        }
        writer.set(Stage::Finalize);
        assert!(list.add(1).is_ok());
    }

    #[test]
    fn racing_writers_never_land_inside_the_window() {
        let (writer, reader) = stage_marker();
        let list = SnapshotableList::new(reader);
        let done = AtomicBool::new(false);

        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        let _ = list.add(0u8);
                        let _ = list.remove_where(|_| true);
                    }
                });
            }
            for _ in 0..2_000 {
                writer.set(Stage::Finalize);
                std::thread::yield_now();
                writer.set(Stage::Snapshot);
                list.copy_snapshot();
                assert_eq!(list.live().len(), list.get().len());
                assert!(!list.is_dirty());
            }
            done.store(true, Ordering::Release);
        });
    }
}
