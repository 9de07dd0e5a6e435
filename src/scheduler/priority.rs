use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::task::Task;

/// Memory minimum applied when requirements are given without `memory_mb`.
pub const DEFAULT_REQUIRED_MEMORY_MB: f64 = 512.0;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Urgent = 3,
    Critical = 4,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Low,
        TaskPriority::Normal,
        TaskPriority::High,
        TaskPriority::Urgent,
        TaskPriority::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Normal => "NORMAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Urgent => "URGENT",
            TaskPriority::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown task priority: {0}")]
pub struct UnknownPriority(pub String);

impl std::str::FromStr for TaskPriority {
    type Err = UnknownPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskPriority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPriority(s.to_string()))
    }
}

/// Capability tags and resource minimums a worker must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub memory_mb: Option<f64>,
}

impl TaskRequirements {
    pub fn with_capabilities<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            memory_mb: None,
        }
    }

    pub fn required_memory_mb(&self) -> f64 {
        self.memory_mb.unwrap_or(DEFAULT_REQUIRED_MEMORY_MB)
    }
}

/// A pending task together with its scheduling attributes.
#[derive(Debug, Clone)]
pub struct PriorityTask {
    pub task: Task,
    pub priority: TaskPriority,
    pub requirements: Option<TaskRequirements>,
    /// Submission sequence number, assigned by the queue.
    pub(crate) seq: u64,
}

impl PriorityTask {
    pub fn new(task: Task, priority: TaskPriority, requirements: Option<TaskRequirements>) -> Self {
        Self {
            task,
            priority,
            requirements,
            seq: 0,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.task.created_at
    }

    /// Queue order: `Less` means `self` is dispatched first.
    /// Higher priority first, then earlier creation, then earlier submission.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.task.created_at.cmp(&other.task.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}
