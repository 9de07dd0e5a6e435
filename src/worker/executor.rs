use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::ExecutorConfig;
use crate::protocol::message::TaskRequest;
use crate::scheduler::task::ResultPayload;

/// Receives progress percentages from a running execution.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<u8>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<u8>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, progress: u8) {
        let _ = self.tx.send(progress.min(100));
    }
}

/// Execution backend. Implementations never fail past this boundary: every
/// problem comes back as a payload with `success: false`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &TaskRequest, progress: ProgressReporter) -> ResultPayload;
}

/// Largest serialized task data also passed through the environment. A single
/// environment string is limited to 128 KiB on Linux.
pub const MAX_ENV_DATA_BYTES: usize = 32 * 1024;

/// Runs task code through an interpreter as a child process.
///
/// The code is the last argument and the task data goes to stdin as JSON.
/// Data up to [`MAX_ENV_DATA_BYTES`] is mirrored in `WINLINK_TASK_DATA`. The
/// memory ceiling is advertised to the child in `WINLINK_MEMORY_LIMIT_MB`;
/// enforcing it is the sandbox's job. The timeout covers feeding stdin as well
/// as waiting for the child.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    memory_limit_mb: u64,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            memory_limit_mb: config.memory_limit_mb,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn process_output(
        task_id: &str,
        output: std::process::Output,
        execution_time: f64,
    ) -> ResultPayload {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        if output.status.success() {
            let result = serde_json::from_str::<Value>(stdout.trim()).ok();
            tracing::info!(task_id, execution_time, "Task execution succeeded");
            ResultPayload {
                success: true,
                result,
                error: None,
                stdout,
                stderr,
                execution_time,
                memory_used: 0.0,
            }
        } else {
            let error = if stderr.trim().is_empty() {
                format!("Exit code: {:?}", exit_code)
            } else {
                stderr.trim().to_string()
            };
            tracing::info!(task_id, exit_code = ?exit_code, "Task execution failed");
            ResultPayload {
                success: false,
                result: None,
                error: Some(error),
                stdout,
                stderr,
                execution_time,
                memory_used: 0.0,
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(&self, request: &TaskRequest, progress: ProgressReporter) -> ResultPayload {
        let task_id = request.task_id.as_str();
        let data = match serde_json::to_string(&request.data) {
            Ok(data) => data,
            Err(e) => return ResultPayload::failure(format!("Invalid task data: {}", e)),
        };
        tracing::info!(task_id, program = %self.program, "Executing task");

        let started = Instant::now();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&request.code)
            .env("WINLINK_TASK_ID", task_id)
            .env("WINLINK_MEMORY_LIMIT_MB", self.memory_limit_mb.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if data.len() <= MAX_ENV_DATA_BYTES {
            command.env("WINLINK_TASK_DATA", &data);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id, error = %e, "Failed to start task process");
                return ResultPayload::failure(format!("Failed to start {}: {}", self.program, e));
            }
        };
        progress.report(10);

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // The child may exit without reading its input.
                let _ = stdin.write_all(data.as_bytes()).await;
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        // Dropping `run` on expiry kills the child and closes its stdin.
        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) => {
                Self::process_output(task_id, output, started.elapsed().as_secs_f64())
            }
            Ok(Err(e)) => {
                tracing::error!(task_id, error = %e, "Task process failed");
                ResultPayload::failure(e.to_string())
            }
            Err(_) => {
                tracing::warn!(task_id, timeout_secs = self.timeout.as_secs(), "Task timed out");
                let mut payload = ResultPayload::failure(format!(
                    "Task timed out after {} seconds",
                    self.timeout.as_secs()
                ));
                payload.execution_time = started.elapsed().as_secs_f64();
                payload
            }
        }
    }
}
