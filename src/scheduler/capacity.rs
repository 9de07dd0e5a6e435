use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::priority::TaskRequirements;
use crate::scheduler::task::{Task, TaskStatus};

/// Workers silent for longer than this are never selected.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i64 = 300;

/// cpu or memory utilisation above this percentage makes a worker non-admissible.
pub const MAX_UTILISATION_PERCENT: f64 = 90.0;

/// Decay factor of the success-rate moving average.
pub const SUCCESS_RATE_ALPHA: f64 = 0.1;

const CPU_WEIGHT: f64 = 0.30;
const MEMORY_WEIGHT: f64 = 0.25;
const FILL_WEIGHT: f64 = 0.25;
const RESPONSE_WEIGHT: f64 = 0.20;
const RESPONSE_CAP_SECS: f64 = 60.0;
const SPEED_CAP_SECS: f64 = 300.0;
const MIN_RELIABILITY: f64 = 0.1;

/// Resource snapshot a worker reports in `resource_data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerTelemetry {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    #[serde(default)]
    pub memory_total_mb: f64,
    #[serde(default)]
    pub memory_available_mb: f64,
    #[serde(default)]
    pub disk_percent: f64,
    #[serde(default)]
    pub disk_free_gb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_plugged: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_containers: Option<u32>,
}

/// Live load snapshot of one worker, as seen by the load balancer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerCapacity {
    pub worker_id: String,
    pub max_concurrent_tasks: u32,
    /// Tasks reserved or in flight on this worker.
    pub current_tasks: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_available_mb: f64,
    pub last_heartbeat: DateTime<Utc>,
    /// Mean execution time in seconds.
    pub avg_task_time: f64,
    /// Moving average in `[0, 1]`.
    pub success_rate: f64,
    pub capabilities: BTreeSet<String>,
    pub performance_score: f64,
}

impl WorkerCapacity {
    pub fn new(worker_id: impl Into<String>, max_concurrent_tasks: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            max_concurrent_tasks,
            current_tasks: 0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
            memory_available_mb: 0.0,
            last_heartbeat: Utc::now(),
            avg_task_time: 0.0,
            success_rate: 1.0,
            capabilities: BTreeSet::new(),
            performance_score: 1.0,
        }
    }

    /// Lower is better. The weighted utilisation is divided by the worker's
    /// reliability, so unreliable workers score higher.
    pub fn calculate_load_score(&self) -> f64 {
        let cpu = (self.cpu_percent / 100.0).clamp(0.0, 1.0);
        let memory = (self.memory_percent / 100.0).clamp(0.0, 1.0);
        let fill = if self.max_concurrent_tasks == 0 {
            1.0
        } else {
            (self.current_tasks as f64 / self.max_concurrent_tasks as f64).min(1.0)
        };
        let response = (self.avg_task_time / RESPONSE_CAP_SECS).clamp(0.0, 1.0);

        let weighted = cpu * CPU_WEIGHT
            + memory * MEMORY_WEIGHT
            + fill * FILL_WEIGHT
            + response * RESPONSE_WEIGHT;
        weighted / self.success_rate.max(MIN_RELIABILITY)
    }

    pub fn is_alive(&self, heartbeat_timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat <= heartbeat_timeout
    }

    /// Hard admission gate, using the default heartbeat timeout.
    pub fn can_accept_task(&self, requirements: Option<&TaskRequirements>) -> bool {
        self.admits(
            requirements,
            Duration::seconds(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            Utc::now(),
        )
    }

    pub fn admits(
        &self,
        requirements: Option<&TaskRequirements>,
        heartbeat_timeout: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        if self.current_tasks >= self.max_concurrent_tasks {
            return false;
        }
        if !self.is_alive(heartbeat_timeout, now) {
            return false;
        }
        if self.cpu_percent > MAX_UTILISATION_PERCENT || self.memory_percent > MAX_UTILISATION_PERCENT {
            return false;
        }
        match requirements {
            Some(req) => self.memory_available_mb >= req.required_memory_mb(),
            None => true,
        }
    }

    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|cap| self.capabilities.contains(cap))
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn apply_telemetry(&mut self, telemetry: &WorkerTelemetry) {
        self.cpu_percent = telemetry.cpu_percent;
        self.memory_percent = telemetry.memory_percent;
        self.memory_available_mb = telemetry.memory_available_mb;
        self.touch();
    }

    /// Release one reservation and fold the outcome into the success rate.
    pub fn record_completion(&mut self, success: bool) {
        self.current_tasks = self.current_tasks.saturating_sub(1);
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate =
            (SUCCESS_RATE_ALPHA * outcome + (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate).clamp(0.0, 1.0);
    }

    /// Adopt the window's figures where it has any, then recompute the
    /// performance score as the mean of reliability, speed and spare capacity.
    pub fn refresh_performance(&mut self, window: &PerformanceWindow) {
        if let Some(rate) = window.success_rate {
            self.success_rate = rate;
        }
        if let Some(avg) = window.avg_task_time {
            self.avg_task_time = avg;
        }
        let factors = [
            self.success_rate,
            1.0 - (self.avg_task_time / SPEED_CAP_SECS).min(1.0),
            (1.0 - self.calculate_load_score()).clamp(0.0, 1.0),
        ];
        self.performance_score = factors.iter().sum::<f64>() / factors.len() as f64;
    }
}

/// Figures derived from a worker's most recent terminal tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceWindow {
    /// completed / (completed + failed); `None` when the window has no terminal tasks.
    pub success_rate: Option<f64>,
    /// Mean seconds from start to completion over completed tasks with both stamps.
    pub avg_task_time: Option<f64>,
}

impl PerformanceWindow {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut durations = Vec::new();

        for task in tasks {
            match task.status {
                TaskStatus::Completed => {
                    completed += 1;
                    if let Some(secs) = task.execution_secs() {
                        durations.push(secs);
                    }
                }
                TaskStatus::Failed => failed += 1,
                _ => {}
            }
        }

        let terminal = completed + failed;
        Self {
            success_rate: (terminal > 0).then(|| completed as f64 / terminal as f64),
            avg_task_time: (!durations.is_empty())
                .then(|| durations.iter().sum::<f64>() / durations.len() as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskType;
    use serde_json::Map;

    fn idle(id: &str) -> WorkerCapacity {
        let mut w = WorkerCapacity::new(id, 2);
        w.memory_available_mb = 4096.0;
        w
    }

    #[test]
    fn idle_reliable_worker_has_zero_load() {
        assert_eq!(idle("w").calculate_load_score(), 0.0);
    }

    #[test]
    fn load_score_weights() {
        let mut w = idle("w");
        w.cpu_percent = 50.0;
        w.memory_percent = 40.0;
        w.current_tasks = 1;
        w.avg_task_time = 120.0;
        let expected = 0.5 * 0.30 + 0.4 * 0.25 + 0.5 * 0.25 + 1.0 * 0.20;
        assert!((w.calculate_load_score() - expected).abs() < 1e-9);

        w.success_rate = 0.5;
        assert!((w.calculate_load_score() - expected / 0.5).abs() < 1e-9);
        w.success_rate = 0.0;
        assert!((w.calculate_load_score() - expected / 0.1).abs() < 1e-9);
    }

    #[test]
    fn load_score_monotonic_in_cpu() {
        let mut w = idle("w");
        w.memory_percent = 30.0;
        let mut previous = w.calculate_load_score();
        for cpu in (0..=100).step_by(5) {
            w.cpu_percent = cpu as f64;
            let score = w.calculate_load_score();
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn full_worker_rejected() {
        let mut w = idle("w");
        w.current_tasks = 2;
        assert!(!w.can_accept_task(None));
    }

    #[test]
    fn stale_heartbeat_rejected() {
        let mut w = idle("w");
        w.last_heartbeat = Utc::now() - Duration::seconds(301);
        assert!(!w.can_accept_task(None));
        w.last_heartbeat = Utc::now() - Duration::seconds(200);
        assert!(w.can_accept_task(None));
    }

    #[test]
    fn hot_cpu_rejected_even_when_idle() {
        let mut w = idle("w");
        w.cpu_percent = 95.0;
        assert_eq!(w.current_tasks, 0);
        assert!(!w.can_accept_task(None));

        let mut w = idle("w");
        w.memory_percent = 91.0;
        assert!(!w.can_accept_task(None));
    }

    #[test]
    fn memory_requirement_defaults_to_512() {
        let mut w = idle("w");
        w.memory_available_mb = 500.0;
        assert!(w.can_accept_task(None));
        assert!(!w.can_accept_task(Some(&TaskRequirements::default())));

        let small = TaskRequirements {
            memory_mb: Some(256.0),
            ..Default::default()
        };
        assert!(w.can_accept_task(Some(&small)));
    }

    #[test]
    fn completion_decays_success_rate() {
        let mut w = idle("w");
        w.current_tasks = 1;
        w.record_completion(false);
        assert_eq!(w.current_tasks, 0);
        assert!((w.success_rate - 0.9).abs() < 1e-9);

        w.record_completion(true);
        assert_eq!(w.current_tasks, 0);
        assert!((w.success_rate - 0.91).abs() < 1e-9);
    }

    fn finished(status: TaskStatus, secs: i64) -> Task {
        let mut task = Task::new(TaskType::Custom, "pass".to_string(), Map::new());
        let end = Utc::now();
        task.status = status;
        task.started_at = Some(end - Duration::seconds(secs));
        task.completed_at = Some(end);
        task
    }

    #[test]
    fn window_from_recent_tasks() {
        let tasks = vec![
            finished(TaskStatus::Completed, 10),
            finished(TaskStatus::Completed, 30),
            finished(TaskStatus::Failed, 5),
            Task::new(TaskType::Custom, "pass".to_string(), Map::new()),
        ];
        let window = PerformanceWindow::from_tasks(&tasks);
        assert!((window.success_rate.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((window.avg_task_time.unwrap() - 20.0).abs() < 1e-6);

        assert_eq!(PerformanceWindow::from_tasks(&[]), PerformanceWindow::default());
    }

    #[test]
    fn performance_score_is_mean_of_three_factors() {
        let mut w = idle("w");
        w.refresh_performance(&PerformanceWindow {
            success_rate: Some(0.5),
            avg_task_time: Some(150.0),
        });
        let load = w.calculate_load_score();
        let expected = (0.5 + 0.5 + (1.0 - load).clamp(0.0, 1.0)) / 3.0;
        assert!((w.performance_score - expected).abs() < 1e-9);
        assert_eq!(w.success_rate, 0.5);
    }
}
