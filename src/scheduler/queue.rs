use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::scheduler::priority::{PriorityTask, TaskPriority};

/// Heap entry. Only the ordering key and the id live in the heap; the task
/// itself lives in the side table.
#[derive(Debug, Clone)]
struct QueueEntry {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: Uuid,
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: the greatest entry is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

/// Pending tasks ordered by priority, then age.
///
/// Removal is lazy: `remove` only drops the task from the side table and the
/// stale heap entry is skipped when it reaches the top. `heap_len` can
/// therefore exceed `len` until those entries are popped.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
    live: HashMap<Uuid, PriorityTask>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns false if a task with the same id is already queued.
    pub fn push(&mut self, mut item: PriorityTask) -> bool {
        if self.live.contains_key(&item.task.id) {
            return false;
        }
        self.next_seq += 1;
        item.seq = self.next_seq;
        self.insert(item);
        true
    }

    /// Put back a popped task, keeping its original position in the order.
    pub fn requeue(&mut self, item: PriorityTask) {
        self.insert(item);
    }

    fn insert(&mut self, item: PriorityTask) {
        self.heap.push(QueueEntry {
            priority: item.priority,
            created_at: item.task.created_at,
            seq: item.seq,
            task_id: item.task.id,
        });
        self.live.insert(item.task.id, item);
    }

    /// Remove and return the next task to dispatch, skipping cancelled entries.
    pub fn pop(&mut self) -> Option<PriorityTask> {
        while let Some(entry) = self.heap.pop() {
            let is_current = self
                .live
                .get(&entry.task_id)
                .is_some_and(|item| item.seq == entry.seq);
            if is_current {
                return self.live.remove(&entry.task_id);
            }
        }
        None
    }

    /// Remove a queued task from the side table. Its heap entry becomes stale.
    pub fn remove(&mut self, task_id: &Uuid) -> Option<PriorityTask> {
        self.live.remove(task_id)
    }

    pub fn get(&self, task_id: &Uuid) -> Option<&PriorityTask> {
        self.live.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &Uuid) -> Option<&mut PriorityTask> {
        self.live.get_mut(task_id)
    }

    pub fn contains(&self, task_id: &Uuid) -> bool {
        self.live.contains_key(task_id)
    }

    /// Live queued tasks, unordered.
    pub fn iter(&self) -> impl Iterator<Item = &PriorityTask> {
        self.live.values()
    }

    /// Number of live queued tasks.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Heap entries, including stale ones left by cancellation.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Live queued tasks per priority.
    pub fn count_by_priority(&self) -> HashMap<TaskPriority, usize> {
        let mut counts: HashMap<TaskPriority, usize> =
            TaskPriority::ALL.into_iter().map(|p| (p, 0)).collect();
        for item in self.live.values() {
            *counts.entry(item.priority).or_default() += 1;
        }
        counts
    }
}
