//! Allocation records, requests, outcomes, and placement selection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PlacementStrategy;
use crate::core::{ResourceRequirements, Task, TaskId, TaskPriority};
use crate::pool::{PooledResource, ResourceType};

/// Units granted from one resource toward an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    /// Resource the units came from.
    pub resource_id: Uuid,
    /// Type of that resource.
    pub kind: ResourceType,
    /// Units granted.
    pub amount: f64,
}

/// A live allocation in the ledger. Destroyed exactly once, by release or
/// preemption; the id is removed atomically with the capacity credit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Allocation identifier.
    pub id: Uuid,
    /// Owning task.
    pub task_id: TaskId,
    /// Concrete grants backing the allocation.
    pub grants: Vec<Grant>,
    /// The requirement the grants satisfy (possibly degraded).
    pub requirements: ResourceRequirements,
    /// Grant timestamp, milliseconds since epoch.
    pub granted_at_ms: u128,
    /// Optional expiry, milliseconds since epoch.
    pub expires_at_ms: Option<u128>,
    /// Priority of the owning task at grant time.
    pub priority: TaskPriority,
    /// Whether preemption may evict this allocation.
    pub preemptable: bool,
}

impl ResourceAllocation {
    /// Total units across all grants; the preemption pressure measure.
    #[must_use]
    pub fn total_units(&self) -> f64 {
        self.grants.iter().map(|g| g.amount).sum()
    }
}

/// A request presented to the pool.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    /// Requesting task.
    pub task_id: TaskId,
    /// Requested magnitudes.
    pub requirements: ResourceRequirements,
    /// Degrade floor; `None` disables the `Degrade` overflow path.
    pub min_requirements: Option<ResourceRequirements>,
    /// Priority, drives wait-queue ordering and preemption.
    pub priority: TaskPriority,
    /// Whether the resulting allocation may later be preempted.
    pub preemptable: bool,
    /// Task tags fed to smart placement.
    pub affinity_tags: Vec<String>,
}

impl AllocationRequest {
    /// Build a request from a task record.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            requirements: task.requirements,
            min_requirements: task.min_requirements,
            priority: task.priority,
            preemptable: task.priority != TaskPriority::Urgent,
            affinity_tags: task.tags.clone(),
        }
    }
}

/// Typed outcome of an allocation attempt. Never a panic across the boundary.
#[derive(Debug, Clone)]
pub enum AllocationOutcome {
    /// Capacity reserved; the allocation is live in the ledger.
    Granted(ResourceAllocation),
    /// Parked in the wait queue at the given position.
    Queued {
        /// Zero-based position in the wait queue at enqueue time.
        position: usize,
    },
    /// Refused synchronously.
    Rejected {
        /// Why the request was refused.
        reason: String,
    },
}

impl AllocationOutcome {
    /// True for the `Granted` variant.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Pick one resource per requested axis according to the placement strategy.
///
/// Each axis must fit entirely within a single resource; requests larger than
/// any one resource fail even when the type's aggregate headroom would
/// suffice, which is exactly the fragmentation `defragment` exists to repair.
/// Returns `None` when any axis cannot be placed.
pub(crate) fn select_grants(
    resources: &HashMap<Uuid, PooledResource>,
    requirements: &ResourceRequirements,
    affinity_tags: &[String],
    strategy: PlacementStrategy,
) -> Option<Vec<Grant>> {
    let mut grants = Vec::new();
    for kind in ResourceType::AXES {
        let amount = kind.axis_amount(requirements);
        if amount <= 0.0 {
            continue;
        }
        let mut candidates: Vec<&PooledResource> = resources
            .values()
            .filter(|r| r.kind == kind && r.fits(amount))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Deterministic base order before strategy-specific selection.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let chosen = match strategy {
            PlacementStrategy::FirstFit => candidates[0],
            PlacementStrategy::BestFit => candidates
                .iter()
                .min_by(|a, b| {
                    a.available()
                        .partial_cmp(&b.available())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()?,
            PlacementStrategy::WorstFit => candidates
                .iter()
                .max_by(|a, b| {
                    a.available()
                        .partial_cmp(&b.available())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()?,
            PlacementStrategy::Smart => candidates
                .iter()
                .max_by(|a, b| {
                    smart_score(a, affinity_tags)
                        .partial_cmp(&smart_score(b, affinity_tags))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()?,
        };
        grants.push(Grant {
            resource_id: chosen.id,
            kind,
            amount,
        });
    }
    Some(grants)
}

/// Smart placement score: affinity-tag overlap dominates, then the resource's
/// performance score and configured priority.
fn smart_score(resource: &PooledResource, tags: &[String]) -> f64 {
    let overlap = resource
        .metadata
        .affinity_tags
        .iter()
        .filter(|t| tags.contains(*t))
        .count() as f64;
    overlap * 10.0 + resource.metadata.performance_score + f64::from(resource.metadata.priority)
}
