//! Pooled resource model: typed capacity, status transitions, and the
//! append-only allocation history.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{ResourceRequirements, TaskId};

/// Typed resource classes managed by the pool. Closed set; handlers dispatch
/// over the enum rather than strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// CPU cores.
    CpuCore,
    /// Memory blocks.
    MemoryBlock,
    /// IO channels.
    IoChannel,
    /// Network bandwidth.
    NetworkBandwidth,
    /// Worker threads.
    WorkerThread,
    /// Generic compute units.
    ComputeUnit,
}

impl ResourceType {
    /// The four requirement axes and the resource type each one draws from.
    pub const AXES: [Self; 4] = [
        Self::CpuCore,
        Self::MemoryBlock,
        Self::IoChannel,
        Self::NetworkBandwidth,
    ];

    /// Amount requested on this axis by a requirement record.
    #[must_use]
    pub fn axis_amount(self, req: &ResourceRequirements) -> f64 {
        match self {
            Self::CpuCore | Self::WorkerThread | Self::ComputeUnit => req.cpu,
            Self::MemoryBlock => req.memory,
            Self::IoChannel => req.io,
            Self::NetworkBandwidth => req.network,
        }
    }
}

/// Capacity description of a pooled resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    /// Capacity in normalized units.
    pub value: f64,
    /// Whether elastic scaling may clone/remove this resource.
    pub scalable: bool,
    /// Upper bound on elastic growth for the resource's template.
    pub max_scale_factor: f64,
}

/// Lifecycle status of a pooled resource. Status transitions are the only
/// mutation path besides capacity bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Idle, accepting allocations.
    Available,
    /// Carrying at least one allocation; still accepting if headroom remains.
    Allocated,
    /// Held back from placement by an operator.
    Reserved,
    /// Under maintenance; excluded from placement.
    Maintenance,
    /// Failed a health check; excluded until recovery.
    Failed,
    /// Being added/removed by elastic scaling.
    Scaling,
}

impl ResourceStatus {
    /// True when placement may use the resource.
    #[must_use]
    pub const fn is_placeable(self) -> bool {
        matches!(self, Self::Available | Self::Allocated)
    }
}

/// Descriptive metadata attached to a resource.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceMetadata {
    /// Placement priority among equally fitting resources.
    pub priority: u8,
    /// Affinity tags matched against task tags by smart placement.
    pub affinity_tags: Vec<String>,
    /// Free-form constraints (informational).
    pub constraints: Vec<String>,
    /// Relative performance score used by smart placement.
    pub performance_score: f64,
}

/// Action recorded in a resource's allocation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// Units granted to a task.
    Granted,
    /// Units returned.
    Released,
    /// Units reclaimed by preemption.
    Preempted,
    /// A grant migrated here during defragmentation.
    MigratedIn,
    /// A grant migrated away during defragmentation.
    MigratedOut,
    /// Marked failed by a health check.
    MarkedFailed,
    /// Recovered from failed/maintenance.
    Recovered,
}

/// One append-only history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationEvent {
    /// Timestamp, milliseconds since epoch.
    pub at_ms: u128,
    /// What happened.
    pub action: HistoryAction,
    /// Task involved, when applicable.
    pub task_id: Option<TaskId>,
    /// Units moved.
    pub amount: f64,
}

/// History ring bound; oldest entries are dropped past this.
const HISTORY_LIMIT: usize = 64;

/// A single resource in the pool ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledResource {
    /// Unique identifier.
    pub id: Uuid,
    /// Resource type.
    pub kind: ResourceType,
    /// Capacity description.
    pub capacity: ResourceCapacity,
    /// Units currently allocated.
    pub allocated: f64,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Descriptive metadata.
    pub metadata: ResourceMetadata,
    /// Consecutive failed health probes.
    pub consecutive_failures: u32,
    /// Consecutive successful probes while failed.
    pub consecutive_successes: u32,
    /// Timestamp of the last probe.
    pub last_check_ms: u128,
    /// Append-only allocation history (bounded ring).
    pub history: VecDeque<AllocationEvent>,
}

impl PooledResource {
    /// Create an idle resource.
    #[must_use]
    pub fn new(kind: ResourceType, capacity: ResourceCapacity, metadata: ResourceMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            capacity,
            allocated: 0.0,
            status: ResourceStatus::Available,
            metadata,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check_ms: 0,
            history: VecDeque::new(),
        }
    }

    /// Headroom available for new grants; zero when not placeable.
    #[must_use]
    pub fn available(&self) -> f64 {
        if !self.status.is_placeable() {
            return 0.0;
        }
        (self.capacity.value - self.allocated).max(0.0)
    }

    /// Fraction of capacity in use.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.capacity.value <= 0.0 {
            return 0.0;
        }
        (self.allocated / self.capacity.value).clamp(0.0, 1.0)
    }

    /// True when the resource can host `amount` more units.
    #[must_use]
    pub fn fits(&self, amount: f64) -> bool {
        self.status.is_placeable() && self.available() >= amount
    }

    /// Append a history record, dropping the oldest past the ring bound.
    pub fn record(&mut self, action: HistoryAction, task_id: Option<TaskId>, amount: f64) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(AllocationEvent {
            at_ms: crate::util::clock::now_ms(),
            action,
            task_id,
            amount,
        });
    }

    /// Bill units to this resource and keep status in sync.
    pub fn charge(&mut self, amount: f64, task_id: TaskId) {
        self.allocated += amount;
        self.status = ResourceStatus::Allocated;
        self.record(HistoryAction::Granted, Some(task_id), amount);
    }

    /// Return units and keep status in sync.
    pub fn credit(&mut self, amount: f64, task_id: TaskId, action: HistoryAction) {
        self.allocated = (self.allocated - amount).max(0.0);
        if self.allocated == 0.0 && self.status == ResourceStatus::Allocated {
            self.status = ResourceStatus::Available;
        }
        self.record(action, Some(task_id), amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(capacity: f64) -> PooledResource {
        PooledResource::new(
            ResourceType::CpuCore,
            ResourceCapacity { value: capacity, scalable: false, max_scale_factor: 1.0 },
            ResourceMetadata::default(),
        )
    }

    #[test]
    fn test_charge_credit_round_trip() {
        let mut r = cpu(4.0);
        assert!(r.fits(3.0));
        r.charge(3.0, 1);
        assert_eq!(r.status, ResourceStatus::Allocated);
        assert!((r.available() - 1.0).abs() < f64::EPSILON);
        assert!(!r.fits(2.0));

        r.credit(3.0, 1, HistoryAction::Released);
        assert_eq!(r.status, ResourceStatus::Available);
        assert!((r.available() - 4.0).abs() < f64::EPSILON);
        assert_eq!(r.history.len(), 2);
    }

    #[test]
    fn test_unplaceable_has_no_headroom() {
        let mut r = cpu(4.0);
        r.status = ResourceStatus::Failed;
        assert_eq!(r.available(), 0.0);
        assert!(!r.fits(0.5));
    }

    #[test]
    fn test_history_ring_bounded() {
        let mut r = cpu(1000.0);
        for i in 0..200 {
            r.record(HistoryAction::Granted, Some(i), 1.0);
        }
        assert_eq!(r.history.len(), HISTORY_LIMIT);
    }

    #[test]
    fn test_axis_amount_mapping() {
        let req = ResourceRequirements { cpu: 1.0, memory: 2.0, io: 3.0, network: 4.0 };
        assert!((ResourceType::CpuCore.axis_amount(&req) - 1.0).abs() < f64::EPSILON);
        assert!((ResourceType::MemoryBlock.axis_amount(&req) - 2.0).abs() < f64::EPSILON);
        assert!((ResourceType::IoChannel.axis_amount(&req) - 3.0).abs() < f64::EPSILON);
        assert!((ResourceType::NetworkBandwidth.axis_amount(&req) - 4.0).abs() < f64::EPSILON);
    }
}
