//! Read-only metric snapshots exported to external observability collaborators.
//!
//! Each component owns its counters and exposes them only through an
//! immutable snapshot method; there is no external mutation path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::pool::ResourceType;

/// Per-resource-type capacity figures inside a [`PoolMetrics`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TypeCapacity {
    /// Total capacity across live resources of this type.
    pub capacity: f64,
    /// Currently allocated units.
    pub allocated: f64,
    /// Remaining headroom.
    pub available: f64,
}

/// Snapshot of the resource pool ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolMetrics {
    /// Capacity figures per resource type.
    pub by_type: HashMap<ResourceType, TypeCapacity>,
    /// Aggregate utilization in `[0, 1]`.
    pub utilization: f64,
    /// Fraction of free capacity split into fragments too small for the mean
    /// request, in `[0, 1]`.
    pub fragmentation_ratio: f64,
    /// Successful allocations since construction.
    pub allocations_granted: u64,
    /// Releases since construction.
    pub releases: u64,
    /// Requests parked in the wait queue.
    pub allocations_queued: u64,
    /// Requests rejected (policy or capacity).
    pub allocations_rejected: u64,
    /// Allocations evicted to satisfy higher-priority waiters.
    pub preemptions: u64,
    /// Requests satisfied only after degrading toward their floor.
    pub degraded_grants: u64,
    /// Current wait-queue depth.
    pub wait_queue_depth: usize,
    /// Elastic scale-up events.
    pub scale_ups: u64,
    /// Elastic scale-down events.
    pub scale_downs: u64,
    /// Resources currently marked failed or in maintenance.
    pub unhealthy_resources: usize,
    /// True when the ledger detected corruption and halted admissions.
    pub halted: bool,
}

/// Snapshot of scheduler behavior.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulingMetrics {
    /// Tasks admitted to run.
    pub scheduled: u64,
    /// Tasks deferred into queues.
    pub deferred: u64,
    /// Tasks rejected at admission.
    pub rejected: u64,
    /// Completed tasks observed via the completion feed.
    pub completed: u64,
    /// Failed tasks observed via the completion feed.
    pub failed: u64,
    /// Mean queue wait in milliseconds.
    pub avg_wait_ms: f64,
    /// Mean submission-to-terminal time in milliseconds.
    pub avg_turnaround_ms: f64,
    /// Completions per second over the scheduler's lifetime.
    pub throughput_per_sec: f64,
    /// Jain fairness index over per-tier service, in `(0, 1]`.
    pub fairness_index: f64,
    /// Fraction of deadline-bearing tasks that missed, in `[0, 1]`.
    pub deadline_miss_rate: f64,
    /// Tasks preempted from resources.
    pub preemptions: u64,
    /// Admissions that displaced a running task (context switches).
    pub context_switches: u64,
    /// Aging boosts applied.
    pub boosts_applied: u64,
    /// Current depth per queue tier name.
    pub queue_depths: HashMap<String, usize>,
}

/// Snapshot of optimizer/worker-pool behavior.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OptimizationMetrics {
    /// Tasks accepted by `submit_task`.
    pub submitted: u64,
    /// Terminal completions.
    pub completed: u64,
    /// Terminal failures.
    pub failed: u64,
    /// Terminal timeouts.
    pub timed_out: u64,
    /// Terminal cancellations.
    pub cancelled: u64,
    /// Retried attempts.
    pub retries: u64,
    /// Tasks currently executing on workers.
    pub running: usize,
    /// Current adaptive concurrency bound.
    pub max_concurrency: usize,
    /// Worker threads in the pool.
    pub worker_count: usize,
    /// Mean execution time of completed attempts, milliseconds.
    pub avg_execution_ms: f64,
    /// Concurrency scale-up events.
    pub scale_ups: u64,
    /// Concurrency scale-down events.
    pub scale_downs: u64,
    /// Speedup factor of the most recent parallelization plan.
    pub last_plan_speedup: f64,
}

/// Jain's fairness index over non-negative service totals. Returns 1.0 for an
/// empty or all-zero population.
#[must_use]
pub fn jain_fairness_index(service: &[f64]) -> f64 {
    let n = service.len();
    if n == 0 {
        return 1.0;
    }
    let sum: f64 = service.iter().sum();
    if sum <= 0.0 {
        return 1.0;
    }
    let sum_sq: f64 = service.iter().map(|s| s * s).sum();
    (sum * sum) / (n as f64 * sum_sq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jain_index_bounds() {
        assert!((jain_fairness_index(&[]) - 1.0).abs() < f64::EPSILON);
        assert!((jain_fairness_index(&[5.0, 5.0, 5.0]) - 1.0).abs() < 1e-9);

        // One class hogging service drives the index toward 1/n.
        let skewed = jain_fairness_index(&[100.0, 0.0, 0.0, 0.0]);
        assert!((skewed - 0.25).abs() < 1e-9);

        let mid = jain_fairness_index(&[4.0, 2.0]);
        assert!(mid > 0.25 && mid < 1.0);
    }
}
