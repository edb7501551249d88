//! Coarse time-bucketed priority queue for scheduled tasks.
//!
//! Tasks are grouped into buckets `width` milliseconds wide, keyed by
//! `next_call_time / width`. Polling walks the buckets whose start is due
//! and removes the tasks whose exact deadline has passed; a bucket that
//! lies entirely at or below the current time needs no per-task check.
//! A task never fires before its exact deadline.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::task::Task;

/// Buckets of scheduled tasks ordered by due time.
#[derive(Debug)]
pub struct TaskPriorityQueue {
    width: u64,
    buckets: BTreeMap<u64, VecDeque<Arc<Task>>>,
    len: usize,
}

impl TaskPriorityQueue {
    /// An empty queue with buckets `width` ms wide (minimum 1).
    pub fn new(width: u64) -> Self {
        Self {
            width: width.max(1),
            buckets: BTreeMap::new(),
            len: 0,
        }
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no tasks are queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn key(&self, time: u64) -> u64 {
        time / self.width
    }

    /// Queue `task` by its current next call time. Returns `false` (and
    /// queues nothing) if the task is already queued.
    pub fn add(&mut self, task: Arc<Task>) -> bool {
        if !task.set_queued() {
            return false;
        }
        let key = self.key(task.next_call_time());
        self.buckets.entry(key).or_default().push_back(task);
        self.len += 1;
        true
    }

    /// Remove `task` if queued. Returns whether it was found.
    pub fn remove(&mut self, task: &Arc<Task>) -> bool {
        if !task.is_queued() {
            return false;
        }
        let key = self.key(task.next_call_time());
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return false;
        };
        let Some(pos) = bucket.iter().position(|t| Arc::ptr_eq(t, task)) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
        self.len -= 1;
        task.set_unqueued();
        true
    }

    /// Remove and return every task due at or before `up_time`, earliest
    /// bucket first. Returned tasks are already marked unqueued.
    pub fn poll_due(&mut self, up_time: u64) -> Vec<Arc<Task>> {
        let mut due = Vec::new();
        let last_key = self.key(up_time);
        let keys: Vec<u64> = self.buckets.range(..=last_key).map(|(k, _)| *k).collect();

        for key in keys {
            let fully_below = (key + 1)
                .checked_mul(self.width)
                .is_some_and(|end| end - 1 <= up_time);
            let Some(bucket) = self.buckets.get_mut(&key) else {
                continue;
            };
            if fully_below {
                due.extend(bucket.drain(..));
            } else {
                let mut kept = VecDeque::with_capacity(bucket.len());
                for task in bucket.drain(..) {
                    if task.next_call_time() <= up_time {
                        due.push(task);
                    } else {
                        kept.push_back(task);
                    }
                }
                *bucket = kept;
            }
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }

        self.len -= due.len();
        for task in &due {
            task.set_unqueued();
        }
        due
    }

    /// Every queued task, earliest bucket first.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.buckets.values().flatten().cloned().collect()
    }
}
