//! Deterministic candidate ordering for each scheduling algorithm.
//!
//! Given a fixed snapshot of priorities, deadlines, and arrival times, the
//! produced order is total and stable: every comparator falls back to arrival
//! timestamp and then task id.

use std::cmp::Ordering;

use crate::config::SchedulingAlgorithm;
use crate::pool::{PoolSnapshot, ResourceType};
use crate::sched::QueuedTask;

/// Indices of `entries` in admission order for the given algorithm.
#[must_use]
pub fn order_candidates(
    entries: &[QueuedTask],
    algorithm: SchedulingAlgorithm,
    snapshot: &PoolSnapshot,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by(|&a, &b| compare(&entries[a], &entries[b], algorithm, snapshot));
    order
}

fn compare(
    a: &QueuedTask,
    b: &QueuedTask,
    algorithm: SchedulingAlgorithm,
    snapshot: &PoolSnapshot,
) -> Ordering {
    let primary = match algorithm {
        SchedulingAlgorithm::Fcfs => arrival(a).cmp(&arrival(b)),
        SchedulingAlgorithm::ShortestJobFirst => a
            .task
            .estimated_duration
            .cmp(&b.task.estimated_duration),
        // Higher effective rank first; boosting feeds into the rank.
        SchedulingAlgorithm::PriorityFirst | SchedulingAlgorithm::MultilevelQueue => {
            b.effective_rank().cmp(&a.effective_rank())
        }
        // Entries passed over fewer rotations go first.
        SchedulingAlgorithm::RoundRobin => a.rr_rounds.cmp(&b.rr_rounds),
        SchedulingAlgorithm::FairShare => total_order(a.vruntime, b.vruntime),
        SchedulingAlgorithm::EarliestDeadlineFirst => a
            .deadline_ms
            .unwrap_or(u128::MAX)
            .cmp(&b.deadline_ms.unwrap_or(u128::MAX)),
        // Tasks demanding the scarcest resources yield; cheap-on-scarce first.
        SchedulingAlgorithm::ResourceAware => {
            total_order(scarcity_cost(a, snapshot), scarcity_cost(b, snapshot))
        }
    };
    primary
        .then_with(|| arrival(a).cmp(&arrival(b)))
        .then_with(|| a.task.id.cmp(&b.task.id))
}

/// Arrival timestamp used for FCFS and all tie-breaks: original submission
/// time, so preemption requeues do not lose queue seniority.
fn arrival(entry: &QueuedTask) -> u128 {
    entry.task.created_at_ms
}

fn total_order(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Demand weighted by current scarcity of each requested axis.
fn scarcity_cost(entry: &QueuedTask, snapshot: &PoolSnapshot) -> f64 {
    ResourceType::AXES
        .iter()
        .map(|kind| kind.axis_amount(&entry.task.requirements) * snapshot.scarcity(*kind))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::{ResourceRequirements, Task, TaskPriority, TaskType};
    use crate::sched::QueuedTask;

    fn entry(id: u64, created_at_ms: u128) -> QueuedTask {
        let mut task = Task::builder("t", TaskType::Computation).build().unwrap();
        task.id = id;
        task.created_at_ms = created_at_ms;
        QueuedTask::new(task, created_at_ms, None, 0.0)
    }

    #[test]
    fn test_fcfs_orders_by_arrival() {
        let entries = vec![entry(2, 200), entry(1, 100), entry(3, 300)];
        let order = order_candidates(&entries, SchedulingAlgorithm::Fcfs, &PoolSnapshot::default());
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn test_sjf_orders_by_estimate() {
        let mut long = entry(1, 100);
        long.task.estimated_duration = Duration::from_secs(30);
        let mut short = entry(2, 200);
        short.task.estimated_duration = Duration::from_secs(1);
        let entries = vec![long, short];
        let order = order_candidates(
            &entries,
            SchedulingAlgorithm::ShortestJobFirst,
            &PoolSnapshot::default(),
        );
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_priority_orders_by_boosted_rank() {
        let mut low = entry(1, 100);
        low.task.priority = TaskPriority::Low;
        let mut normal = entry(2, 200);
        normal.task.priority = TaskPriority::Normal;
        // Boost lifts the low task past normal.
        low.boost = 2;
        let entries = vec![normal, low];
        let order = order_candidates(
            &entries,
            SchedulingAlgorithm::PriorityFirst,
            &PoolSnapshot::default(),
        );
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_edf_sorts_missing_deadline_last() {
        let mut urgent = entry(1, 300);
        urgent.deadline_ms = Some(1_000);
        let mut later = entry(2, 100);
        later.deadline_ms = Some(5_000);
        let none = entry(3, 50);
        let entries = vec![none, later, urgent];
        let order = order_candidates(
            &entries,
            SchedulingAlgorithm::EarliestDeadlineFirst,
            &PoolSnapshot::default(),
        );
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn test_fair_share_prefers_least_served() {
        let mut served = entry(1, 100);
        served.vruntime = 500.0;
        let mut fresh = entry(2, 200);
        fresh.vruntime = 10.0;
        let entries = vec![served, fresh];
        let order = order_candidates(
            &entries,
            SchedulingAlgorithm::FairShare,
            &PoolSnapshot::default(),
        );
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_resource_aware_yields_on_scarcity() {
        let snapshot = PoolSnapshot {
            available: ResourceRequirements { cpu: 1.0, memory: 8.0, io: 4.0, network: 4.0 },
            capacity: ResourceRequirements { cpu: 8.0, memory: 8.0, io: 4.0, network: 4.0 },
            utilization: 0.5,
            ..PoolSnapshot::default()
        };
        // CPU is scarce (7/8 allocated); the CPU-hungry task yields.
        let mut cpu_hungry = entry(1, 100);
        cpu_hungry.task.requirements = ResourceRequirements::cpu(4.0);
        let mut mem_hungry = entry(2, 200);
        mem_hungry.task.requirements =
            ResourceRequirements { memory: 4.0, ..Default::default() };
        let entries = vec![cpu_hungry, mem_hungry];
        let order = order_candidates(&entries, SchedulingAlgorithm::ResourceAware, &snapshot);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_ties_break_by_arrival_then_id() {
        let entries = vec![entry(5, 100), entry(3, 100), entry(4, 50)];
        let order = order_candidates(
            &entries,
            SchedulingAlgorithm::PriorityFirst,
            &PoolSnapshot::default(),
        );
        // Equal ranks: arrival 50 first, then equal arrivals by id.
        assert_eq!(order, vec![2, 1, 0]);
    }
}
