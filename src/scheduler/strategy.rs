use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::scheduler::capacity::WorkerCapacity;
use crate::scheduler::priority::TaskRequirements;

const PERFORMANCE_WEIGHT: f64 = 0.3;

/// Picks one worker out of an already-admissible candidate set.
pub trait SelectionStrategy: Send + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// `candidates` is never empty when called by the balancer.
    fn select(
        &mut self,
        candidates: &[&WorkerCapacity],
        requirements: Option<&TaskRequirements>,
    ) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastLoaded,
    #[default]
    PerformanceBased,
    CapabilityAware,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::RoundRobin,
        StrategyKind::LeastLoaded,
        StrategyKind::PerformanceBased,
        StrategyKind::CapabilityAware,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::RoundRobin => "round_robin",
            StrategyKind::LeastLoaded => "least_loaded",
            StrategyKind::PerformanceBased => "performance_based",
            StrategyKind::CapabilityAware => "capability_aware",
        }
    }

    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            StrategyKind::RoundRobin => Box::new(RoundRobin::default()),
            StrategyKind::LeastLoaded => Box::new(LeastLoaded),
            StrategyKind::PerformanceBased => Box::new(PerformanceBased),
            StrategyKind::CapabilityAware => Box::new(CapabilityAware),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown load balancing strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl std::str::FromStr for StrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}

/// Cycles through workers in worker-id order.
///
/// The cursor is the last selected id rather than an index, so membership
/// changes between calls never skip or repeat a worker.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<String>,
}

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    fn select(
        &mut self,
        candidates: &[&WorkerCapacity],
        _requirements: Option<&TaskRequirements>,
    ) -> Option<String> {
        let mut ids: Vec<&str> = candidates.iter().map(|w| w.worker_id.as_str()).collect();
        ids.sort_unstable();

        let next = match &self.last {
            Some(last) => ids
                .iter()
                .find(|id| **id > last.as_str())
                .or_else(|| ids.first()),
            None => ids.first(),
        }?;

        let chosen = next.to_string();
        self.last = Some(chosen.clone());
        Some(chosen)
    }
}

/// Minimises the load score.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LeastLoaded
    }

    fn select(
        &mut self,
        candidates: &[&WorkerCapacity],
        _requirements: Option<&TaskRequirements>,
    ) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| by_score(a.calculate_load_score(), b.calculate_load_score()))
            .map(|w| w.worker_id.clone())
    }
}

/// Maximises `performance_score * 0.3 - load_score`.
#[derive(Debug, Default)]
pub struct PerformanceBased;

fn performance_rank(worker: &WorkerCapacity) -> f64 {
    worker.performance_score * PERFORMANCE_WEIGHT - worker.calculate_load_score()
}

fn best_performer(candidates: &[&WorkerCapacity]) -> Option<String> {
    candidates
        .iter()
        .max_by(|a, b| by_score(performance_rank(a), performance_rank(b)))
        .map(|w| w.worker_id.clone())
}

impl SelectionStrategy for PerformanceBased {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PerformanceBased
    }

    fn select(
        &mut self,
        candidates: &[&WorkerCapacity],
        _requirements: Option<&TaskRequirements>,
    ) -> Option<String> {
        best_performer(candidates)
    }
}

/// Narrows to workers advertising every requested capability, falling back
/// to all candidates when none do, then ranks by performance.
#[derive(Debug, Default)]
pub struct CapabilityAware;

impl SelectionStrategy for CapabilityAware {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CapabilityAware
    }

    fn select(
        &mut self,
        candidates: &[&WorkerCapacity],
        requirements: Option<&TaskRequirements>,
    ) -> Option<String> {
        let required = requirements
            .map(|r| r.capabilities.as_slice())
            .unwrap_or_default();
        let capable: Vec<&WorkerCapacity> = candidates
            .iter()
            .copied()
            .filter(|w| w.has_capabilities(required))
            .collect();

        if capable.is_empty() {
            best_performer(candidates)
        } else {
            best_performer(&capable)
        }
    }
}

// NaN compares equal to everything.
fn by_score(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}
