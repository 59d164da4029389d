use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rpa_core_types::{ErrorInfo, NodeId, RpaError, TaskId, TaskStatus};
use serde::Serialize;
use serde_json::to_writer_pretty;

use crate::{EventKind, ProgressEvent, ProgressReporter};

#[derive(Clone, Debug, Default, Serialize)]
pub struct ProgressStats {
    pub total_events: u64,
    pub status_events: u64,
    pub progress_events: u64,
    pub log_events: u64,
    pub duplicates: u64,
}

/// Latest known state of a task, folded from its event stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub current_node: Option<NodeId>,
    pub last_error: Option<ErrorInfo>,
    pub last_seq: u64,
    pub updated_at: DateTime<Utc>,
}

impl TaskView {
    fn from_event(event: &ProgressEvent) -> Self {
        Self {
            task_id: event.task_id.clone(),
            status: event.status,
            progress: event.progress,
            current_node: event.current_node.clone(),
            last_error: event.error.clone(),
            last_seq: event.seq,
            updated_at: event.recorded_at,
        }
    }

    fn apply(&mut self, event: &ProgressEvent) {
        self.status = event.status;
        self.progress = event.progress;
        if event.current_node.is_some() {
            self.current_node = event.current_node.clone();
        }
        if event.error.is_some() {
            self.last_error = event.error.clone();
        }
        self.last_seq = event.seq;
        self.updated_at = event.recorded_at;
    }
}

#[derive(Debug)]
struct BoundedRing<T> {
    capacity: usize,
    data: VecDeque<T>,
}

impl<T> BoundedRing<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            data: VecDeque::new(),
        }
    }
}

impl<T: Clone> BoundedRing<T> {
    fn push(&mut self, item: T) {
        if self.data.len() == self.capacity {
            self.data.pop_front();
        }
        self.data.push_back(item);
    }

    fn snapshot(&self) -> Vec<T> {
        self.data.iter().cloned().collect()
    }
}

/// In-memory consumer keeping recent events and a per-task view.
///
/// Folding is idempotent: an event whose `seq` is not newer than the last one
/// applied for that task is counted as a duplicate and otherwise ignored.
pub struct InMemoryProgressReporter {
    task_capacity: usize,
    events: Mutex<BoundedRing<ProgressEvent>>,
    task_events: DashMap<TaskId, Mutex<BoundedRing<ProgressEvent>>>,
    views: DashMap<TaskId, TaskView>,
    stats: Mutex<ProgressStats>,
}

impl InMemoryProgressReporter {
    pub fn new(capacity: usize) -> Self {
        let global_capacity = capacity.max(1);
        let task_capacity = std::cmp::max(global_capacity / 4, 16);
        Self {
            task_capacity,
            events: Mutex::new(BoundedRing::new(global_capacity)),
            task_events: DashMap::new(),
            views: DashMap::new(),
            stats: Mutex::new(ProgressStats::default()),
        }
    }

    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.events.lock().snapshot()
    }

    pub fn stats(&self) -> ProgressStats {
        self.stats.lock().clone()
    }

    pub fn view(&self, task_id: &TaskId) -> Option<TaskView> {
        self.views.get(task_id).map(|entry| entry.value().clone())
    }

    pub fn views(&self) -> Vec<TaskView> {
        self.views.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn recent_task(&self, task_id: &TaskId) -> Vec<ProgressEvent> {
        self.task_events
            .get(task_id)
            .map(|entry| entry.value().lock().snapshot())
            .unwrap_or_default()
    }

    /// Statuses observed for a task, in delivery order.
    pub fn status_trail(&self, task_id: &TaskId) -> Vec<TaskStatus> {
        self.recent_task(task_id)
            .into_iter()
            .filter(|event| event.kind == EventKind::Status)
            .map(|event| event.status)
            .collect()
    }

    pub fn write_snapshot<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let snapshot = ProgressSnapshot {
            stats: self.stats(),
            tasks: self.views(),
            events: self.snapshot(),
        };
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        to_writer_pretty(&mut writer, &snapshot)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        writer.flush()?;
        Ok(())
    }

    /// Returns false when the event was a duplicate.
    fn fold(&self, event: &ProgressEvent) -> bool {
        match self.views.entry(event.task_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if event.seq <= entry.get().last_seq {
                    return false;
                }
                entry.get_mut().apply(event);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(TaskView::from_event(event));
            }
        }
        true
    }

    fn update_stats(&self, event: &ProgressEvent) {
        let mut stats = self.stats.lock();
        stats.total_events = stats.total_events.saturating_add(1);
        match event.kind {
            EventKind::Status => stats.status_events = stats.status_events.saturating_add(1),
            EventKind::Progress => {
                stats.progress_events = stats.progress_events.saturating_add(1)
            }
            EventKind::Log => stats.log_events = stats.log_events.saturating_add(1),
        }
    }
}

#[async_trait]
impl ProgressReporter for InMemoryProgressReporter {
    async fn report(&self, event: ProgressEvent) -> Result<(), RpaError> {
        if !self.fold(&event) {
            let mut stats = self.stats.lock();
            stats.duplicates = stats.duplicates.saturating_add(1);
            return Ok(());
        }
        self.events.lock().push(event.clone());
        {
            let mut entry = self
                .task_events
                .entry(event.task_id.clone())
                .or_insert_with(|| Mutex::new(BoundedRing::new(self.task_capacity)));
            entry.value_mut().lock().push(event.clone());
        }
        self.update_stats(&event);
        Ok(())
    }
}

#[derive(Serialize)]
struct ProgressSnapshot {
    stats: ProgressStats,
    tasks: Vec<TaskView>,
    events: Vec<ProgressEvent>,
}
