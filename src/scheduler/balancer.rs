use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::scheduler::capacity::{
    PerformanceWindow, WorkerCapacity, WorkerTelemetry, DEFAULT_HEARTBEAT_TIMEOUT_SECS,
};
use crate::scheduler::priority::TaskRequirements;
use crate::scheduler::strategy::{SelectionStrategy, StrategyKind, UnknownStrategy};
use crate::store::TaskStore;

#[derive(Debug, Clone)]
pub struct BalancerOptions {
    pub strategy: StrategyKind,
    pub heartbeat_timeout: Duration,
    /// Number of recent terminal tasks used to derive the performance score.
    pub performance_window: usize,
    /// Concurrency assumed for a worker until it announces its own.
    pub default_max_concurrent_tasks: u32,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            heartbeat_timeout: Duration::seconds(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            performance_window: 20,
            default_max_concurrent_tasks: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LoadStatistics {
    pub total_workers: usize,
    pub active_workers: usize,
    pub total_active_tasks: u32,
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub avg_performance_score: f64,
    pub current_strategy: StrategyKind,
}

#[derive(Debug)]
struct BalancerState {
    workers: HashMap<String, WorkerCapacity>,
    strategy: Box<dyn SelectionStrategy>,
}

/// Capacity table plus the active selection strategy.
pub struct LoadBalancer {
    state: Mutex<BalancerState>,
    store: Arc<dyn TaskStore>,
    options: BalancerOptions,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    pub fn new(options: BalancerOptions, store: Arc<dyn TaskStore>) -> Self {
        tracing::info!(strategy = %options.strategy, "Load balancer initialized");
        Self {
            state: Mutex::new(BalancerState {
                workers: HashMap::new(),
                strategy: options.strategy.build(),
            }),
            store,
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BalancerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn window_for(&self, worker_id: &str) -> PerformanceWindow {
        match self.store.recent_tasks(worker_id, self.options.performance_window) {
            Ok(tasks) => PerformanceWindow::from_tasks(&tasks),
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Failed to load recent tasks");
                PerformanceWindow::default()
            }
        }
    }

    /// Upsert a worker from a telemetry report and re-derive its performance
    /// score. Returns the updated snapshot.
    pub fn register_worker(&self, worker_id: &str, telemetry: &WorkerTelemetry) -> WorkerCapacity {
        let window = self.window_for(worker_id);
        let mut state = self.lock();
        let default_max = self.options.default_max_concurrent_tasks;
        let worker = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                tracing::info!(worker_id, "Worker registered");
                WorkerCapacity::new(worker_id, default_max)
            });
        worker.apply_telemetry(telemetry);
        worker.refresh_performance(&window);
        tracing::debug!(
            worker_id,
            cpu = worker.cpu_percent,
            memory = worker.memory_percent,
            performance = worker.performance_score,
            "Worker capacity updated"
        );
        worker.clone()
    }

    /// Upsert a worker's static profile from its `ready` announcement.
    pub fn declare_worker(
        &self,
        worker_id: &str,
        capabilities: &[String],
        max_concurrent_tasks: Option<u32>,
    ) -> WorkerCapacity {
        let mut state = self.lock();
        let default_max = self.options.default_max_concurrent_tasks;
        let worker = state
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                tracing::info!(worker_id, "Worker registered");
                WorkerCapacity::new(worker_id, default_max)
            });
        worker.capabilities = capabilities.iter().cloned().collect();
        if let Some(max) = max_concurrent_tasks {
            worker.max_concurrent_tasks = max;
        }
        worker.touch();
        worker.clone()
    }

    /// Replace a worker's capacity entry wholesale.
    pub fn insert_worker(&self, capacity: WorkerCapacity) {
        self.lock()
            .workers
            .insert(capacity.worker_id.clone(), capacity);
    }

    /// Drop a worker and any reservations it held.
    pub fn unregister_worker(&self, worker_id: &str) -> Option<WorkerCapacity> {
        let removed = self.lock().workers.remove(worker_id);
        if let Some(worker) = &removed {
            tracing::info!(
                worker_id,
                dropped_reservations = worker.current_tasks,
                "Worker unregistered"
            );
        }
        removed
    }

    /// Refresh a worker's heartbeat without a telemetry update.
    pub fn touch_worker(&self, worker_id: &str) -> bool {
        match self.lock().workers.get_mut(worker_id) {
            Some(worker) => {
                worker.touch();
                true
            }
            None => false,
        }
    }

    /// Pick an admissible worker with the current strategy and reserve one
    /// slot on it. `None` when no worker passes the admission gates.
    pub fn select_worker(&self, requirements: Option<&TaskRequirements>) -> Option<String> {
        let now = Utc::now();
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut candidates: Vec<&WorkerCapacity> = state
            .workers
            .values()
            .filter(|w| w.admits(requirements, self.options.heartbeat_timeout, now))
            .collect();
        if candidates.is_empty() {
            tracing::debug!("No admissible workers");
            return None;
        }
        candidates.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        let selected = state.strategy.select(&candidates, requirements)?;
        let strategy = state.strategy.kind();
        if let Some(worker) = state.workers.get_mut(&selected) {
            worker.current_tasks += 1;
            tracing::debug!(
                worker_id = %selected,
                %strategy,
                current_tasks = worker.current_tasks,
                "Worker selected"
            );
        }
        Some(selected)
    }

    /// Release a reservation and record the outcome. Returns false for an
    /// unknown worker.
    pub fn task_completed(&self, worker_id: &str, success: bool) -> bool {
        match self.lock().workers.get_mut(worker_id) {
            Some(worker) => {
                worker.record_completion(success);
                true
            }
            None => false,
        }
    }

    /// Undo a reservation that never turned into a dispatch.
    pub fn release_reservation(&self, worker_id: &str) {
        if let Some(worker) = self.lock().workers.get_mut(worker_id) {
            worker.current_tasks = worker.current_tasks.saturating_sub(1);
        }
    }

    pub fn strategy(&self) -> StrategyKind {
        self.lock().strategy.kind()
    }

    pub fn set_strategy(&self, name: &str) -> Result<StrategyKind, UnknownStrategy> {
        let kind: StrategyKind = name.parse()?;
        self.lock().strategy = kind.build();
        tracing::info!(strategy = %kind, "Load balancing strategy changed");
        Ok(kind)
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerCapacity> {
        self.lock().workers.get(worker_id).cloned()
    }

    /// All workers, ordered by id.
    pub fn workers(&self) -> Vec<WorkerCapacity> {
        let mut workers: Vec<WorkerCapacity> = self.lock().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn load_statistics(&self) -> LoadStatistics {
        let now = Utc::now();
        let state = self.lock();
        let total = state.workers.len();
        let mean = |f: fn(&WorkerCapacity) -> f64| {
            if total == 0 {
                0.0
            } else {
                state.workers.values().map(f).sum::<f64>() / total as f64
            }
        };

        LoadStatistics {
            total_workers: total,
            active_workers: state
                .workers
                .values()
                .filter(|w| w.is_alive(self.options.heartbeat_timeout, now))
                .count(),
            total_active_tasks: state.workers.values().map(|w| w.current_tasks).sum(),
            avg_cpu_percent: round_to(mean(|w| w.cpu_percent), 2),
            avg_memory_percent: round_to(mean(|w| w.memory_percent), 2),
            avg_performance_score: round_to(mean(|w| w.performance_score), 3),
            current_strategy: state.strategy.kind(),
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn balancer(strategy: StrategyKind) -> LoadBalancer {
        LoadBalancer::new(
            BalancerOptions {
                strategy,
                ..Default::default()
            },
            Arc::new(MemoryStore::new()),
        )
    }

    fn telemetry(cpu: f64) -> WorkerTelemetry {
        WorkerTelemetry {
            cpu_percent: cpu,
            memory_percent: 20.0,
            memory_total_mb: 8192.0,
            memory_available_mb: 4096.0,
            ..Default::default()
        }
    }

    #[test]
    fn selection_reserves_capacity() {
        let lb = balancer(StrategyKind::LeastLoaded);
        lb.register_worker("w1", &telemetry(10.0));
        lb.declare_worker("w1", &[], Some(1));

        assert_eq!(lb.select_worker(None).as_deref(), Some("w1"));
        assert_eq!(lb.worker("w1").unwrap().current_tasks, 1);
        assert_eq!(lb.select_worker(None), None);

        assert!(lb.task_completed("w1", true));
        assert_eq!(lb.select_worker(None).as_deref(), Some("w1"));
    }

    #[test]
    fn completion_never_goes_negative() {
        let lb = balancer(StrategyKind::LeastLoaded);
        lb.register_worker("w1", &telemetry(10.0));
        lb.task_completed("w1", false);
        assert_eq!(lb.worker("w1").unwrap().current_tasks, 0);
        assert!(!lb.task_completed("ghost", true));
    }

    #[test]
    fn unknown_strategy_rejected() {
        let lb = balancer(StrategyKind::PerformanceBased);
        assert!(lb.set_strategy("random").is_err());
        assert_eq!(lb.strategy(), StrategyKind::PerformanceBased);
        assert_eq!(lb.set_strategy("round_robin").unwrap(), StrategyKind::RoundRobin);
        assert_eq!(lb.strategy(), StrategyKind::RoundRobin);
    }

    #[test]
    fn unregister_drops_reservations() {
        let lb = balancer(StrategyKind::LeastLoaded);
        lb.register_worker("w1", &telemetry(10.0));
        lb.select_worker(None);
        let removed = lb.unregister_worker("w1").unwrap();
        assert_eq!(removed.current_tasks, 1);

        lb.register_worker("w1", &telemetry(10.0));
        assert_eq!(lb.worker("w1").unwrap().current_tasks, 0);
    }

    #[test]
    fn statistics_average_over_workers() {
        let lb = balancer(StrategyKind::LeastLoaded);
        assert_eq!(lb.load_statistics().total_workers, 0);

        lb.register_worker("a", &telemetry(10.0));
        lb.register_worker("b", &telemetry(30.0));
        lb.select_worker(None);

        let stats = lb.load_statistics();
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.active_workers, 2);
        assert_eq!(stats.total_active_tasks, 1);
        assert_eq!(stats.avg_cpu_percent, 20.0);
        assert_eq!(stats.current_strategy, StrategyKind::LeastLoaded);
    }
}
