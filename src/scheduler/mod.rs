pub mod balancer;
pub mod capacity;
pub mod priority;
pub mod queue;
pub mod strategy;
pub mod task;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

pub use balancer::{BalancerOptions, LoadBalancer, LoadStatistics};
pub use capacity::{WorkerCapacity, WorkerTelemetry};
pub use priority::{PriorityTask, TaskPriority, TaskRequirements};
pub use queue::PriorityQueue;
pub use strategy::{SelectionStrategy, StrategyKind};
pub use task::{ResultPayload, Task, TaskError, TaskStatus, TaskType};

use crate::store::{self, CleanupStats, Event, EventLevel, TaskStore};

pub const DEFAULT_MAX_QUEUED_TASKS: usize = 10_000;
/// Finished tasks kept in memory; older ones are served from the store.
pub const DEFAULT_MAX_FINISHED_TASKS: usize = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Task queue is full ({capacity} tasks)")]
    QueueFull { capacity: usize },

    #[error("Task {0} is already known to the scheduler")]
    DuplicateTask(Uuid),

    #[error("Task {id} is {status}, only pending tasks can be submitted")]
    NotPending { id: Uuid, status: TaskStatus },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task {id} is {status} and can no longer be cancelled")]
    NotCancellable { id: Uuid, status: TaskStatus },

    #[error("Only finished tasks can be cleared, not {0} ones")]
    NotFinished(TaskStatus),

    #[error("Task {id} is not running on worker {worker_id}")]
    NotAssigned { id: Uuid, worker_id: String },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// A task the tick moved to RUNNING; the caller sends it to `worker_id`.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker_id: String,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStatistics {
    /// Heap entries, including stale ones left by cancellation.
    pub total_queued: usize,
    pub total_pending: usize,
    /// Dispatched and finished tasks held in the registry.
    pub total_tracked: usize,
    /// Finished tasks among `total_tracked`.
    pub total_finished: usize,
    pub by_priority: BTreeMap<TaskPriority, usize>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SchedulerStatistics {
    pub queue: QueueStatistics,
    pub load_balancing: LoadStatistics,
    pub by_status: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: PriorityQueue,
    /// Running tasks and the most recently finished ones, keyed by id.
    tasks: HashMap<Uuid, PriorityTask>,
    /// Finished ids in the registry, oldest first.
    finished: VecDeque<Uuid>,
}

/// Pending queue, authoritative task registry and dispatch loop body.
///
/// All methods take `&self`; the queue and registry share one lock, which is
/// always taken before the balancer's.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    balancer: Arc<LoadBalancer>,
    store: Arc<dyn TaskStore>,
    max_queued_tasks: usize,
    max_finished_tasks: usize,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("balancer", &self.balancer)
            .field("max_queued_tasks", &self.max_queued_tasks)
            .field("max_finished_tasks", &self.max_finished_tasks)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(balancer: Arc<LoadBalancer>, store: Arc<dyn TaskStore>) -> Self {
        Self::with_capacity(balancer, store, DEFAULT_MAX_QUEUED_TASKS)
    }

    pub fn with_capacity(
        balancer: Arc<LoadBalancer>,
        store: Arc<dyn TaskStore>,
        max_queued_tasks: usize,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            balancer,
            store,
            max_queued_tasks,
            max_finished_tasks: DEFAULT_MAX_FINISHED_TASKS,
        }
    }

    /// Keep at most `max` finished tasks in memory.
    pub fn with_finished_retention(mut self, max: usize) -> Self {
        self.max_finished_tasks = max;
        self
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    fn event(&self, level: EventLevel, message: String, extra: serde_json::Value) {
        store::record_event(self.store.as_ref(), Event::new(level, "scheduler", message, extra));
    }

    /// Track a task that just finished, evicting the oldest finished ones
    /// beyond the retention limit. Evicted tasks stay in the store.
    fn retire(&self, state: &mut SchedulerState, task_id: Uuid) {
        state.finished.push_back(task_id);
        while state.finished.len() > self.max_finished_tasks {
            let Some(oldest) = state.finished.pop_front() else {
                break;
            };
            state.tasks.remove(&oldest);
            tracing::debug!(task_id = %oldest, "Evicted finished task from memory");
        }
    }

    /// Queue a pending task for dispatch.
    pub fn submit_task(
        &self,
        task: Task,
        priority: TaskPriority,
        requirements: Option<TaskRequirements>,
    ) -> Result<Uuid, SchedulerError> {
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::NotPending {
                id: task.id,
                status: task.status,
            });
        }

        let mut state = self.lock();
        if state.queue.contains(&task.id) || state.tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }
        if state.queue.len() >= self.max_queued_tasks {
            tracing::warn!(task_id = %task.id, capacity = self.max_queued_tasks, "Task queue full");
            return Err(SchedulerError::QueueFull {
                capacity: self.max_queued_tasks,
            });
        }

        let id = task.id;
        store::persist_task(self.store.as_ref(), &task);
        tracing::info!(
            task_id = %id,
            name = task.display_name(),
            %priority,
            attempt = task.attempt,
            "Task submitted"
        );
        state.queue.push(PriorityTask::new(task, priority, requirements));
        drop(state);

        self.event(
            EventLevel::Info,
            format!("Task {} submitted with priority {}", id, priority),
            json!({ "task_id": id, "priority": priority }),
        );
        Ok(id)
    }

    /// Cancel a task that has not been dispatched yet. The task is marked
    /// FAILED with the cancellation sentinel; its heap entry is skipped later.
    pub fn cancel_task(&self, task_id: &Uuid) -> Result<Task, SchedulerError> {
        let mut state = self.lock();
        let Some(mut item) = state.queue.remove(task_id) else {
            return Err(match state.tasks.get(task_id) {
                Some(item) => SchedulerError::NotCancellable {
                    id: *task_id,
                    status: item.task.status,
                },
                None => SchedulerError::TaskNotFound(*task_id),
            });
        };

        item.task.cancel()?;
        store::persist_task(self.store.as_ref(), &item.task);
        let task = item.task.clone();
        state.tasks.insert(task.id, item);
        self.retire(&mut state, task.id);
        drop(state);

        tracing::info!(task_id = %task_id, "Task cancelled");
        self.event(
            EventLevel::Info,
            format!("Task {} cancelled", task_id),
            json!({ "task_id": task_id }),
        );
        Ok(task)
    }

    /// One dispatch pass: try every queued task against the balancer.
    /// Tasks with no admissible worker go back into the queue unchanged.
    pub fn tick(&self) -> Vec<Assignment> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let mut assignments = Vec::new();
        let mut deferred = Vec::new();

        while let Some(mut item) = state.queue.pop() {
            let Some(worker_id) = self.balancer.select_worker(item.requirements.as_ref()) else {
                deferred.push(item);
                continue;
            };

            if let Err(e) = item.task.assign(&worker_id) {
                tracing::error!(task_id = %item.task.id, error = %e, "Queued task could not be assigned");
                self.balancer.release_reservation(&worker_id);
                deferred.push(item);
                continue;
            }

            store::persist_task(self.store.as_ref(), &item.task);
            tracing::info!(
                task_id = %item.task.id,
                worker_id = %worker_id,
                priority = %item.priority,
                "Task dispatched"
            );
            let task = item.task.clone();
            state.tasks.insert(task.id, item);
            assignments.push(Assignment { worker_id, task });
        }

        if !deferred.is_empty() {
            tracing::debug!(waiting = deferred.len(), "No admissible worker for queued tasks");
        }
        for item in deferred {
            state.queue.requeue(item);
        }
        drop(guard);

        for assignment in &assignments {
            self.event(
                EventLevel::Info,
                format!(
                    "Task {} assigned to worker {}",
                    assignment.task.id, assignment.worker_id
                ),
                json!({ "task_id": assignment.task.id, "worker_id": assignment.worker_id }),
            );
        }
        assignments
    }

    /// Feedback edge for a finished task: releases the worker's reservation
    /// and updates its success rate.
    pub fn task_completed(&self, task_id: &Uuid, worker_id: &str, success: bool) {
        if !self.balancer.task_completed(worker_id, success) {
            tracing::debug!(task_id = %task_id, worker_id, "Completion for unregistered worker");
        }
        self.event(
            EventLevel::Info,
            format!("Task {} completed on worker {}", task_id, worker_id),
            json!({ "task_id": task_id, "worker_id": worker_id, "success": success }),
        );
    }

    fn running_task<'a>(
        state: &'a mut SchedulerState,
        task_id: &Uuid,
        worker_id: &str,
    ) -> Result<&'a mut PriorityTask, SchedulerError> {
        let item = state
            .tasks
            .get_mut(task_id)
            .ok_or(SchedulerError::TaskNotFound(*task_id))?;
        let task = &item.task;
        if task.status != TaskStatus::Running || task.worker_id.as_deref() != Some(worker_id) {
            return Err(SchedulerError::NotAssigned {
                id: *task_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(item)
    }

    /// Apply a worker's `task_result`. Results for tasks that are not running
    /// on that worker (cancelled, finished, reassigned) are rejected untouched.
    pub fn record_result(
        &self,
        task_id: &Uuid,
        worker_id: &str,
        payload: &ResultPayload,
    ) -> Result<TaskStatus, SchedulerError> {
        let mut state = self.lock();
        let task = &mut Self::running_task(&mut state, task_id, worker_id)?.task;
        let status = task.apply_result(payload)?;
        store::persist_task(self.store.as_ref(), task);
        match status {
            TaskStatus::Completed => {
                tracing::info!(task_id = %task_id, worker_id, execution_time = payload.execution_time, "Task completed")
            }
            _ => {
                tracing::warn!(task_id = %task_id, worker_id, error = ?task.error, "Task failed")
            }
        }
        self.retire(&mut state, *task_id);
        drop(state);

        self.task_completed(task_id, worker_id, status == TaskStatus::Completed);
        Ok(status)
    }

    /// Fail a dispatched task that the worker refused to run. Returns the
    /// failed entry so the caller can decide on re-submission.
    pub fn fail_task(
        &self,
        task_id: &Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<PriorityTask, SchedulerError> {
        let mut state = self.lock();
        let item = Self::running_task(&mut state, task_id, worker_id)?;
        item.task.fail(error)?;
        store::persist_task(self.store.as_ref(), &item.task);
        let failed = item.clone();
        self.retire(&mut state, *task_id);
        drop(state);

        tracing::warn!(task_id = %task_id, worker_id, error, "Worker rejected task");
        self.task_completed(task_id, worker_id, false);
        Ok(failed)
    }

    /// Record progress reported by the executing worker.
    pub fn update_progress(&self, task_id: &Uuid, worker_id: &str, progress: i64) -> bool {
        let mut state = self.lock();
        let Ok(item) = Self::running_task(&mut state, task_id, worker_id) else {
            tracing::debug!(task_id = %task_id, worker_id, "Ignoring progress for task not running on worker");
            return false;
        };
        item.task.set_progress(progress);
        store::persist_task(self.store.as_ref(), &item.task);
        true
    }

    /// Queue a fresh copy of a failed task with the same priority and
    /// requirements.
    pub fn resubmit(&self, failed: &PriorityTask) -> Result<Uuid, SchedulerError> {
        self.submit_task(
            Task::resubmission_of(&failed.task),
            failed.priority,
            failed.requirements.clone(),
        )
    }

    /// Look a task up in memory, then in the store for finished tasks that
    /// were evicted.
    pub fn get_task(&self, task_id: &Uuid) -> Option<Task> {
        let state = self.lock();
        let task = state
            .queue
            .get(task_id)
            .or_else(|| state.tasks.get(task_id))
            .map(|item| item.task.clone());
        drop(state);

        task.or_else(|| match self.store.get_task(task_id) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to read task from store");
                None
            }
        })
    }

    /// Remove finished tasks with `status` (all finished tasks when `None`)
    /// from memory and the store. Returns how many were removed.
    pub fn clear_tasks(&self, status: Option<TaskStatus>) -> Result<usize, SchedulerError> {
        if let Some(status) = status.filter(|s| !s.is_terminal()) {
            return Err(SchedulerError::NotFinished(status));
        }

        let mut state = self.lock();
        let state = &mut *state;
        let tasks = &mut state.tasks;
        let before = tasks.len();
        tasks.retain(|_, item| !store::finished_matches(&item.task, status));
        let in_memory = before - tasks.len();
        state.finished.retain(|id| tasks.contains_key(id));

        let cleared = match self.store.delete_finished_tasks(status) {
            Ok(stored) => stored.max(in_memory),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to clear tasks from store");
                in_memory
            }
        };
        tracing::info!(cleared, status = ?status, "Cleared finished tasks");
        Ok(cleared)
    }

    /// Drop history older than `cutoff`: finished tasks from memory and the
    /// store, plus old events and offline workers from the store.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> CleanupStats {
        let mut state = self.lock();
        let state = &mut *state;
        let tasks = &mut state.tasks;
        let before = tasks.len();
        tasks.retain(|_, item| {
            let task = &item.task;
            !(task.status.is_terminal() && task.completed_at.is_some_and(|at| at < cutoff))
        });
        let in_memory = before - tasks.len();
        state.finished.retain(|id| tasks.contains_key(id));

        let mut stats = match self.store.cleanup_before(cutoff) {
            Ok(stats) => stats,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to clean up store");
                CleanupStats::default()
            }
        };
        stats.tasks = stats.tasks.max(in_memory);
        tracing::info!(
            cutoff = %cutoff,
            tasks = stats.tasks,
            events = stats.events,
            workers = stats.workers,
            "Cleaned up old history"
        );
        stats
    }

    pub fn priority_of(&self, task_id: &Uuid) -> Option<TaskPriority> {
        let state = self.lock();
        state
            .queue
            .get(task_id)
            .or_else(|| state.tasks.get(task_id))
            .map(|item| item.priority)
    }

    /// Queued, running and retained finished tasks, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let state = self.lock();
        let mut tasks: Vec<Task> = state
            .queue
            .iter()
            .map(|item| item.task.clone())
            .chain(state.tasks.values().map(|item| item.task.clone()))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Ids of tasks currently RUNNING on `worker_id`.
    pub fn running_on(&self, worker_id: &str) -> Vec<Uuid> {
        self.lock()
            .tasks
            .values()
            .map(|item| &item.task)
            .filter(|t| t.status == TaskStatus::Running && t.worker_id.as_deref() == Some(worker_id))
            .map(|t| t.id)
            .collect()
    }

    pub fn queue_statistics(&self) -> QueueStatistics {
        let state = self.lock();
        QueueStatistics {
            total_queued: state.queue.heap_len(),
            total_pending: state.queue.len(),
            total_tracked: state.tasks.len(),
            total_finished: state.finished.len(),
            by_priority: state.queue.count_by_priority().into_iter().collect(),
        }
    }

    pub fn scheduler_statistics(&self) -> SchedulerStatistics {
        let queue = self.queue_statistics();
        let mut by_status = BTreeMap::new();
        for task in self.tasks() {
            *by_status.entry(task.status.to_string()).or_insert(0) += 1;
        }
        SchedulerStatistics {
            queue,
            load_balancing: self.balancer.load_statistics(),
            by_status,
        }
    }
}
