//! Parallelization plans: concurrent task groups with projected timing,
//! speedup, and resource utilization.

use serde::{Deserialize, Serialize};

use crate::core::{ResourceRequirements, SchedulerError, Task, TaskId};
use crate::optimizer::DependencyGraph;
use crate::pool::{PoolSnapshot, ResourceType};

/// A set of tasks with no dependency edges among them, runnable concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group index within the plan, in dependency order.
    pub id: usize,
    /// Member tasks.
    pub task_ids: Vec<TaskId>,
    /// Component-wise sum of member requirements.
    pub requirements: ResourceRequirements,
    /// Indices of groups that must finish first.
    pub depends_on: Vec<usize>,
    /// False when a member demands exclusive access; the group then runs
    /// sequentially.
    pub parallel_executable: bool,
    /// Projected group duration, milliseconds.
    pub projected_ms: f64,
}

/// Projected utilization of the pool while the plan runs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UtilizationProjection {
    /// Peak demand as a fraction of pool capacity, per axis, uncapped;
    /// values above 1.0 mean the axis throttles the plan.
    pub cpu: f64,
    /// Memory axis demand fraction.
    pub memory: f64,
    /// IO axis demand fraction.
    pub io: f64,
    /// Network axis demand fraction.
    pub network: f64,
    /// The axis with the highest demand fraction, when any demand exists.
    pub bottleneck: Option<ResourceType>,
}

/// Derived, read-only parallelization artifact. Regenerated per planning
/// call; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelizationPlan {
    /// Groups in dependency order.
    pub groups: Vec<TaskGroup>,
    /// Projected time running everything back to back, milliseconds.
    pub sequential_ms: f64,
    /// Projected time under this plan, milliseconds.
    pub parallel_ms: f64,
    /// `sequential_ms / parallel_ms`.
    pub speedup: f64,
    /// Speedup per worker, in `(0, 1]`.
    pub efficiency: f64,
    /// Critical-path lower bound, milliseconds.
    pub critical_path_ms: f64,
    /// Peak resource demand projection.
    pub utilization: UtilizationProjection,
}

/// Build a plan for a batch of tasks against the current pool snapshot and
/// worker bound. Pure function of its inputs.
pub fn build_plan(
    tasks: &[Task],
    snapshot: &PoolSnapshot,
    max_concurrency: usize,
) -> Result<ParallelizationPlan, SchedulerError> {
    let graph = DependencyGraph::build(tasks)?;
    let workers = max_concurrency.max(1);

    let mut groups: Vec<TaskGroup> = Vec::new();
    let mut sequential_ms = 0.0_f64;
    let mut parallel_ms = 0.0_f64;
    let mut peak = ResourceRequirements::default();

    for (wave_idx, wave) in graph.layers().into_iter().enumerate() {
        let members: Vec<&Task> = wave
            .iter()
            .map(|id| tasks.iter().find(|t| t.id == *id).expect("layer id from batch"))
            .collect();

        let mut requirements = ResourceRequirements::default();
        let mut wave_sequential = 0.0_f64;
        let mut wave_max = 0.0_f64;
        let mut exclusive = false;
        for task in &members {
            requirements = requirements.plus(&task.requirements);
            let d = task.estimated_duration.as_millis() as f64;
            wave_sequential += d;
            wave_max = wave_max.max(d);
            exclusive |= task.is_exclusive();
        }
        sequential_ms += wave_sequential;

        let projected_ms = if exclusive {
            wave_sequential
        } else {
            // Chunked by the worker bound: a wave wider than the pool of
            // workers runs in rounds.
            let rounds = members.len().div_ceil(workers);
            wave_max * rounds as f64
        };
        parallel_ms += projected_ms;

        if requirements.total() > peak.total() {
            peak = requirements;
        }

        groups.push(TaskGroup {
            id: wave_idx,
            task_ids: wave,
            requirements,
            depends_on: if wave_idx == 0 { Vec::new() } else { vec![wave_idx - 1] },
            parallel_executable: !exclusive,
            projected_ms,
        });
    }

    let speedup = if parallel_ms > 0.0 { sequential_ms / parallel_ms } else { 1.0 };
    let efficiency = (speedup / workers as f64).clamp(0.0, 1.0);

    let fraction = |kind: ResourceType| -> f64 {
        let cap = kind.axis_amount(&snapshot.capacity);
        if cap <= 0.0 {
            0.0
        } else {
            kind.axis_amount(&peak) / cap
        }
    };
    let mut utilization = UtilizationProjection {
        cpu: fraction(ResourceType::CpuCore),
        memory: fraction(ResourceType::MemoryBlock),
        io: fraction(ResourceType::IoChannel),
        network: fraction(ResourceType::NetworkBandwidth),
        bottleneck: None,
    };
    utilization.bottleneck = [
        (ResourceType::CpuCore, utilization.cpu),
        (ResourceType::MemoryBlock, utilization.memory),
        (ResourceType::IoChannel, utilization.io),
        (ResourceType::NetworkBandwidth, utilization.network),
    ]
    .into_iter()
    .filter(|(_, f)| *f > 0.0)
    .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    .map(|(kind, _)| kind);

    Ok(ParallelizationPlan {
        groups,
        sequential_ms,
        parallel_ms,
        speedup,
        efficiency,
        critical_path_ms: graph.critical_path_ms(),
        utilization,
    })
}
