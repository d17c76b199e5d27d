//! Resource pool: typed capacity ledger, placement, overflow handling,
//! preemption, fairness, defragmentation, elastic scaling, and health checks.

pub mod allocation;
pub mod pool;
pub mod resource;

pub use allocation::{AllocationOutcome, AllocationRequest, Grant, ResourceAllocation};
pub use pool::{
    DefragReport, HealthProbe, HealthReport, PoolSnapshot, ResourcePool, ScalingEvent,
};
pub use resource::{
    AllocationEvent, HistoryAction, PooledResource, ResourceCapacity, ResourceMetadata,
    ResourceStatus, ResourceType,
};
