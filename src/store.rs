//! Persistence boundary.
//!
//! The scheduler and the master session layer record tasks, workers and events
//! through [`TaskStore`]. Every call is a side effect: callers log failures and
//! carry on, so a broken store never blocks an in-memory state transition.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::scheduler::capacity::WorkerTelemetry;
use crate::scheduler::task::{Task, TaskStatus};

/// Events kept by [`MemoryStore`] before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub level: EventLevel,
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub extra: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(level: EventLevel, component: &str, message: impl Into<String>, extra: Value) -> Self {
        Self {
            level,
            component: component.to_string(),
            message: message.into(),
            extra,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub address: Option<String>,
    pub status: WorkerStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub telemetry: Option<WorkerTelemetry>,
    pub last_seen: DateTime<Utc>,
}

/// What a history cleanup removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub tasks: usize,
    pub events: usize,
    pub workers: usize,
}

pub trait TaskStore: Send + Sync {
    fn save_task(&self, task: &Task) -> Result<(), StoreError>;

    fn get_task(&self, id: &Uuid) -> Result<Option<Task>, StoreError>;

    /// Up to `limit` tasks assigned to `worker_id`, newest first.
    fn recent_tasks(&self, worker_id: &str, limit: usize) -> Result<Vec<Task>, StoreError>;

    fn save_worker(&self, record: &WorkerRecord) -> Result<(), StoreError>;

    fn log_event(&self, event: Event) -> Result<(), StoreError>;

    /// Delete finished tasks with `status`, or all finished tasks when
    /// `None`. Pending and running tasks are never deleted.
    fn delete_finished_tasks(&self, status: Option<TaskStatus>) -> Result<usize, StoreError>;

    /// Drop finished tasks completed before `cutoff`, events logged before
    /// it and offline workers last seen before it.
    fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupStats, StoreError>;
}

/// Whether a finished-task filter selects `task`.
pub fn finished_matches(task: &Task, status: Option<TaskStatus>) -> bool {
    task.status.is_terminal() && status.map_or(true, |s| s == task.status)
}

/// Save a task, logging instead of failing.
pub fn persist_task(store: &dyn TaskStore, task: &Task) {
    if let Err(e) = store.save_task(task) {
        tracing::warn!(task_id = %task.id, error = %e, "Failed to persist task");
    }
}

pub fn persist_worker(store: &dyn TaskStore, record: &WorkerRecord) {
    if let Err(e) = store.save_worker(record) {
        tracing::warn!(worker_id = %record.worker_id, error = %e, "Failed to persist worker");
    }
}

pub fn record_event(store: &dyn TaskStore, event: Event) {
    if let Err(e) = store.log_event(event) {
        tracing::warn!(error = %e, "Failed to record event");
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    workers: HashMap<String, WorkerRecord>,
    events: VecDeque<Event>,
}

/// In-process store used by the master when no external backend is wired in.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    event_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            event_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.lock().workers.values().cloned().collect()
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.lock().workers.get(worker_id).cloned()
    }

    /// Logged events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.lock().events.iter().cloned().collect()
    }
}

impl TaskStore for MemoryStore {
    fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        self.lock().tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, id: &Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    fn recent_tasks(&self, worker_id: &str, limit: usize) -> Result<Vec<Task>, StoreError> {
        let state = self.lock();
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.worker_id.as_deref() == Some(worker_id))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    fn save_worker(&self, record: &WorkerRecord) -> Result<(), StoreError> {
        self.lock()
            .workers
            .insert(record.worker_id.clone(), record.clone());
        Ok(())
    }

    fn log_event(&self, event: Event) -> Result<(), StoreError> {
        let mut state = self.lock();
        if self.event_capacity == 0 {
            return Ok(());
        }
        while state.events.len() >= self.event_capacity {
            state.events.pop_front();
        }
        state.events.push_back(event);
        Ok(())
    }

    fn delete_finished_tasks(&self, status: Option<TaskStatus>) -> Result<usize, StoreError> {
        let mut state = self.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !finished_matches(task, status));
        Ok(before - state.tasks.len())
    }

    fn cleanup_before(&self, cutoff: DateTime<Utc>) -> Result<CleanupStats, StoreError> {
        let mut state = self.lock();
        let mut stats = CleanupStats::default();

        let before = state.tasks.len();
        state.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.is_some_and(|at| at < cutoff))
        });
        stats.tasks = before - state.tasks.len();

        let before = state.events.len();
        state.events.retain(|event| event.timestamp >= cutoff);
        stats.events = before - state.events.len();

        let before = state.workers.len();
        state
            .workers
            .retain(|_, w| w.status == WorkerStatus::Online || w.last_seen >= cutoff);
        stats.workers = before - state.workers.len();

        Ok(stats)
    }
}
