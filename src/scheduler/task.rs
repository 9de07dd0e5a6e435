use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Error string recorded on a task cancelled before dispatch.
pub const CANCELLED_ERROR: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Custom,
    Computation,
    FileProcessing,
    ImageProcessing,
    DataAnalysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Custom => "custom",
            TaskType::Computation => "computation",
            TaskType::FileProcessing => "file_processing",
            TaskType::ImageProcessing => "image_processing",
            TaskType::DataAnalysis => "data_analysis",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "custom" => Ok(TaskType::Custom),
            "computation" => Ok(TaskType::Computation),
            "file_processing" => Ok(TaskType::FileProcessing),
            "image_processing" => Ok(TaskType::ImageProcessing),
            "data_analysis" => Ok(TaskType::DataAnalysis),
            other => Err(TaskError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Unknown task type: {0}")]
    UnknownType(String),
}

/// Result contract a worker reports for an executed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub memory_used: f64,
}

impl ResultPayload {
    pub fn success(result: Option<Value>, stdout: String, execution_time: f64) -> Self {
        Self {
            success: true,
            result,
            error: None,
            stdout,
            stderr: String::new(),
            execution_time,
            memory_used: 0.0,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            stdout: String::new(),
            stderr: String::new(),
            execution_time: 0.0,
            memory_used: 0.0,
        }
    }

    /// Human readable rendering of whichever sections are non-empty.
    /// Display only; never parsed back.
    pub fn render_output(&self) -> Option<String> {
        let mut parts = Vec::new();
        if !self.stdout.is_empty() {
            parts.push(format!("STDOUT:\n{}", self.stdout));
        }
        if !self.stderr.is_empty() {
            parts.push(format!("STDERR:\n{}", self.stderr));
        }
        match &self.result {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => parts.push(format!("RESULT:\n{}", s)),
            Some(value) => {
                let rendered =
                    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
                parts.push(format!("RESULT:\n{}", rendered));
            }
        }
        if let Some(error) = self.error.as_deref().filter(|e| !e.is_empty()) {
            parts.push(format!("ERROR:\n{}", error));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub output: Option<String>,
    pub progress: u8,
    /// 1 for the original submission, incremented for each re-submission.
    #[serde(default = "first_attempt")]
    pub attempt: u32,
    /// Id of the original submission when this task is a re-submission.
    #[serde(default)]
    pub retry_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn first_attempt() -> u32 {
    1
}

impl Task {
    pub fn new(task_type: TaskType, code: String, data: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            name: String::new(),
            code,
            data,
            status: TaskStatus::Pending,
            worker_id: None,
            result: None,
            error: None,
            output: None,
            progress: 0,
            attempt: 1,
            retry_of: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Fresh pending copy of a failed task, used for re-submission.
    pub fn resubmission_of(previous: &Task) -> Self {
        let mut task = Task::new(previous.task_type, previous.code.clone(), previous.data.clone());
        task.name = previous.name.clone();
        task.attempt = previous.attempt + 1;
        task.retry_of = Some(previous.retry_of.unwrap_or(previous.id));
        task
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Display name, falling back to the task type.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.task_type.as_str()
        } else {
            &self.name
        }
    }

    fn transition(&self, to: TaskStatus) -> TaskError {
        TaskError::InvalidTransition {
            id: self.id,
            from: self.status,
            to,
        }
    }

    /// PENDING -> RUNNING.
    pub fn assign(&mut self, worker_id: &str) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending {
            return Err(self.transition(TaskStatus::Running));
        }
        self.status = TaskStatus::Running;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> COMPLETED.
    pub fn complete(&mut self, result: Option<Value>) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.transition(TaskStatus::Completed));
        }
        self.status = TaskStatus::Completed;
        self.result = result;
        self.progress = 100;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> FAILED.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        if self.status != TaskStatus::Running {
            return Err(self.transition(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// PENDING -> FAILED with the cancellation sentinel. Only legal while queued.
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending {
            return Err(self.transition(TaskStatus::Failed));
        }
        self.status = TaskStatus::Failed;
        self.error = Some(CANCELLED_ERROR.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Apply a worker's result payload. Returns the resulting terminal status.
    pub fn apply_result(&mut self, payload: &ResultPayload) -> Result<TaskStatus, TaskError> {
        if payload.success {
            self.complete(payload.result.clone())?;
        } else {
            let error = payload
                .error
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "task failed without an error message".to_string());
            self.fail(error)?;
            self.result = payload.result.clone();
        }
        self.output = payload.render_output();
        Ok(self.status)
    }

    /// Record progress from the executing worker. Ignored unless running.
    pub fn set_progress(&mut self, progress: i64) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.progress = progress.clamp(0, 100) as u8;
        true
    }

    /// Wall-clock execution time in seconds, if started and finished.
    pub fn execution_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as f64 / 1000.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Task {
        Task::new(TaskType::Computation, "print(1)".to_string(), Map::new())
    }

    #[test]
    fn new_task_is_pending() {
        let t = task();
        assert_eq!(t.status, TaskStatus::Pending);
        assert!(t.worker_id.is_none());
        assert_eq!(t.progress, 0);
        assert_eq!(t.attempt, 1);
    }

    #[test]
    fn assign_only_from_pending() {
        let mut t = task();
        t.assign("w1").unwrap();
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.worker_id.as_deref(), Some("w1"));
        assert!(t.started_at.is_some());
        assert!(matches!(
            t.assign("w2"),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert_eq!(t.worker_id.as_deref(), Some("w1"));
    }

    #[test]
    fn complete_forces_full_progress() {
        let mut t = task();
        t.assign("w1").unwrap();
        t.set_progress(40);
        t.complete(Some(json!(42))).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.progress, 100);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn terminal_tasks_never_reopen() {
        let mut t = task();
        t.assign("w1").unwrap();
        t.fail("boom").unwrap();
        assert!(t.complete(None).is_err());
        assert!(t.fail("again").is_err());
        assert!(t.cancel().is_err());
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("boom"));
    }

    #[test]
    fn complete_requires_running() {
        let mut t = task();
        assert!(t.complete(None).is_err());
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn cancel_only_while_queued() {
        let mut t = task();
        t.cancel().unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some(CANCELLED_ERROR));

        let mut running = task();
        running.assign("w1").unwrap();
        assert!(running.cancel().is_err());
        assert_eq!(running.status, TaskStatus::Running);
    }

    #[test]
    fn progress_is_clamped() {
        let mut t = task();
        assert!(!t.set_progress(50));
        t.assign("w1").unwrap();
        t.set_progress(250);
        assert_eq!(t.progress, 100);
        t.set_progress(-3);
        assert_eq!(t.progress, 0);
    }

    #[test]
    fn output_joins_non_empty_sections() {
        let payload = ResultPayload {
            success: true,
            result: Some(json!({"n": 1})),
            error: None,
            stdout: "hello".to_string(),
            stderr: String::new(),
            execution_time: 0.5,
            memory_used: 1.0,
        };
        let output = payload.render_output().unwrap();
        assert!(output.starts_with("STDOUT:\nhello\n\nRESULT:\n"));
        assert!(!output.contains("STDERR"));
        assert!(!output.contains("ERROR"));
    }

    #[test]
    fn output_absent_when_everything_empty() {
        let payload = ResultPayload::success(None, String::new(), 0.0);
        assert!(payload.render_output().is_none());
    }

    #[test]
    fn failed_payload_propagates_error_verbatim() {
        let mut t = task();
        t.assign("w1").unwrap();
        t.set_progress(30);
        let status = t
            .apply_result(&ResultPayload::failure("ZeroDivisionError"))
            .unwrap();
        assert_eq!(status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(t.progress, 30);
        assert_eq!(t.output.as_deref(), Some("ERROR:\nZeroDivisionError"));
    }

    #[test]
    fn retry_copies_payload_with_new_identity() {
        let mut first = task().with_name("fib");
        first.assign("w1").unwrap();
        first.fail("worker rejected").unwrap();

        let second = Task::resubmission_of(&first);
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, TaskStatus::Pending);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry_of, Some(first.id));
        assert_eq!(second.name, "fib");

        let third = Task::resubmission_of(&second);
        assert_eq!(third.retry_of, Some(first.id));
        assert_eq!(third.attempt, 3);
    }

    #[test]
    fn task_type_string_table() {
        for ty in [
            TaskType::Custom,
            TaskType::Computation,
            TaskType::FileProcessing,
            TaskType::ImageProcessing,
            TaskType::DataAnalysis,
        ] {
            assert_eq!(ty.as_str().parse::<TaskType>().unwrap(), ty);
        }
        assert!("video".parse::<TaskType>().is_err());
    }
}
