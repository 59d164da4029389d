use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use rpa_core_types::{EnvironmentId, FlowId, TaskId};
use tokio::time::Instant;

type Key = (Reverse<i32>, u64);

#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub task: TaskId,
    pub priority: i32,
    /// Submission order, the FIFO tie-break
    pub seq: u64,
    pub environment: EnvironmentId,
    pub flow: FlowId,
    /// Not eligible before this instant
    pub ready_at: Option<Instant>,
}

impl QueueEntry {
    fn key(&self) -> Key {
        (Reverse(self.priority), self.seq)
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.map_or(true, |at| at <= now)
    }
}

/// Pending tasks ordered by priority (highest first) then submission order.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    entries: BTreeMap<Key, QueueEntry>,
    index: HashMap<TaskId, Key>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for the task.
    pub fn push(&mut self, entry: QueueEntry) {
        self.remove(&entry.task);
        let key = entry.key();
        self.index.insert(entry.task.clone(), key);
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, task: &TaskId) -> Option<QueueEntry> {
        let key = self.index.remove(task)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.index.contains_key(task)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Candidates that are ready at `now`, in scheduling order.
    pub fn scan(&self, now: Instant) -> impl Iterator<Item = &QueueEntry> + '_ {
        self.entries.values().filter(move |entry| entry.is_ready(now))
    }

    /// Removes and returns the first ready entry accepted by `eligible`.
    /// Entries the predicate rejects stay queued in place.
    pub fn select<F>(&mut self, now: Instant, mut eligible: F) -> Option<QueueEntry>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let task = self.scan(now).find(|entry| eligible(*entry))?.task.clone();
        self.remove(&task)
    }

    /// Earliest deferred ready time after `now`.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|entry| entry.ready_at)
            .filter(|at| *at > now)
            .min()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskId> + '_ {
        self.entries.values().map(|entry| &entry.task)
    }
}
