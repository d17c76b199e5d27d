//! Resource pool configuration: inventory, placement, overflow, preemption,
//! fairness, defragmentation, elastic scaling, and health checking.

use serde::{Deserialize, Serialize};

use crate::pool::ResourceType;

/// Allocation placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// First resource satisfying the requirement.
    #[default]
    FirstFit,
    /// Tightest fit, minimizes fragmentation.
    BestFit,
    /// Largest remaining slack, favors future flexibility.
    WorstFit,
    /// Affinity- and performance-aware placement.
    Smart,
}

/// Behavior when a request cannot be satisfied immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Park the request in a bounded wait queue re-sorted by priority; the
    /// waiter is rejected once its wait timeout elapses.
    #[default]
    Queue,
    /// Fail the request synchronously.
    Reject,
    /// Delegate the request to the registered fallback pool.
    Redirect {
        /// Name of the fallback pool; must be registered on the pool.
        pool: String,
    },
    /// Shrink the request to its declared minimum and retry once. Tasks
    /// without a declared minimum are rejected.
    Degrade,
}

/// Victim selection for preemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VictimSelection {
    /// Evict the lowest-priority preemptable allocation.
    #[default]
    LowestPriority,
    /// Evict the least-recently-granted allocation.
    LeastRecentlyUsed,
    /// Evict the allocation holding the most total units.
    HighestPressure,
}

/// Preemption policy for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreemptionConfig {
    /// Whether preemption is enabled at all.
    pub enabled: bool,
    /// How victims are chosen. Ties break by oldest grant, then allocation id.
    pub victim: VictimSelection,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self { enabled: false, victim: VictimSelection::LowestPriority }
    }
}

/// Ordering of simultaneously satisfiable waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FairnessPolicy {
    /// Service proportional to per-tier weights.
    #[default]
    ProportionalShare,
    /// Weighted random tickets.
    Lottery,
    /// Deterministic stride scheduling over per-tier passes.
    Stride,
}

/// One resource template in the pool inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource type.
    pub kind: ResourceType,
    /// Number of instances to create.
    pub count: usize,
    /// Capacity units per instance.
    pub capacity: f64,
    /// Whether elastic scaling may add/remove instances of this template.
    pub scalable: bool,
    /// Upper bound on elastic growth as a multiple of `count`.
    pub max_scale_factor: f64,
    /// Affinity tags used by smart placement.
    #[serde(default)]
    pub affinity_tags: Vec<String>,
}

impl ResourceSpec {
    /// A non-scalable spec with the given shape.
    #[must_use]
    pub const fn fixed(kind: ResourceType, count: usize, capacity: f64) -> Self {
        Self {
            kind,
            count,
            capacity,
            scalable: false,
            max_scale_factor: 1.0,
            affinity_tags: Vec::new(),
        }
    }

    /// A scalable spec with the given growth bound.
    #[must_use]
    pub const fn scalable(
        kind: ResourceType,
        count: usize,
        capacity: f64,
        max_scale_factor: f64,
    ) -> Self {
        Self {
            kind,
            count,
            capacity,
            scalable: true,
            max_scale_factor,
            affinity_tags: Vec::new(),
        }
    }
}

/// Elastic scaling thresholds for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolScalingConfig {
    /// Whether elastic scaling runs at all.
    pub enabled: bool,
    /// Aggregate utilization above which the pool grows.
    pub up_threshold: f64,
    /// Aggregate utilization below which the pool shrinks.
    pub down_threshold: f64,
    /// Minimum milliseconds between scaling events.
    pub cooldown_ms: u64,
}

impl Default for PoolScalingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            up_threshold: 0.8,
            down_threshold: 0.3,
            cooldown_ms: 30_000,
        }
    }
}

/// Health-check cadence and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Milliseconds between probe rounds.
    pub interval_ms: u64,
    /// Consecutive failed probes before a resource is marked failed.
    pub failure_threshold: u32,
    /// Consecutive successful probes before a failed resource recovers.
    pub recovery_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            failure_threshold: 3,
            recovery_threshold: 1,
        }
    }
}

/// Full resource pool configuration. Immutable once the pool is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Resource inventory created at initialization.
    pub resources: Vec<ResourceSpec>,
    /// Placement strategy for allocation.
    pub placement: PlacementStrategy,
    /// Policy when no immediate fit exists.
    pub overflow: OverflowPolicy,
    /// Bound on the wait queue used by [`OverflowPolicy::Queue`].
    pub wait_queue_depth: usize,
    /// Per-waiter timeout in milliseconds before rejection.
    pub wait_timeout_ms: u64,
    /// Preemption policy.
    pub preemption: PreemptionConfig,
    /// Ordering of satisfiable waiters.
    pub fairness: FairnessPolicy,
    /// Fragmentation ratio above which `defragment` compacts placements.
    pub defrag_threshold: f64,
    /// Elastic scaling thresholds.
    pub scaling: PoolScalingConfig,
    /// Health check cadence.
    pub health: HealthCheckConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            resources: vec![
                ResourceSpec::fixed(ResourceType::CpuCore, num_cpus::get(), 1.0),
                ResourceSpec::fixed(ResourceType::MemoryBlock, 4, 4.0),
                ResourceSpec::fixed(ResourceType::IoChannel, 2, 4.0),
                ResourceSpec::fixed(ResourceType::NetworkBandwidth, 1, 8.0),
            ],
            placement: PlacementStrategy::FirstFit,
            overflow: OverflowPolicy::Queue,
            wait_queue_depth: 256,
            wait_timeout_ms: 30_000,
            preemption: PreemptionConfig::default(),
            fairness: FairnessPolicy::ProportionalShare,
            defrag_threshold: 0.5,
            scaling: PoolScalingConfig::default(),
            health: HealthCheckConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the resource inventory.
    #[must_use]
    pub fn with_resources(mut self, resources: Vec<ResourceSpec>) -> Self {
        self.resources = resources;
        self
    }

    /// Set the placement strategy.
    #[must_use]
    pub const fn with_placement(mut self, placement: PlacementStrategy) -> Self {
        self.placement = placement;
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Enable preemption with the given victim selection.
    #[must_use]
    pub const fn with_preemption(mut self, victim: VictimSelection) -> Self {
        self.preemption = PreemptionConfig { enabled: true, victim };
        self
    }

    /// Set the fairness policy.
    #[must_use]
    pub const fn with_fairness(mut self, fairness: FairnessPolicy) -> Self {
        self.fairness = fairness;
        self
    }

    /// Set elastic scaling thresholds.
    #[must_use]
    pub const fn with_scaling(mut self, scaling: PoolScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    /// Set the per-waiter timeout.
    #[must_use]
    pub const fn with_wait_timeout_ms(mut self, ms: u64) -> Self {
        self.wait_timeout_ms = ms;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.resources.is_empty() {
            return Err("at least one resource spec is required".into());
        }
        for spec in &self.resources {
            if spec.count == 0 {
                return Err(format!("{:?}: count must be greater than 0", spec.kind));
            }
            if !(spec.capacity.is_finite() && spec.capacity > 0.0) {
                return Err(format!("{:?}: capacity must be positive", spec.kind));
            }
            if spec.max_scale_factor < 1.0 {
                return Err(format!("{:?}: max_scale_factor must be >= 1.0", spec.kind));
            }
        }
        if self.wait_queue_depth == 0 {
            return Err("wait_queue_depth must be greater than 0".into());
        }
        if !(0.0..=1.0).contains(&self.defrag_threshold) {
            return Err("defrag_threshold must be within [0, 1]".into());
        }
        if self.scaling.enabled && self.scaling.down_threshold >= self.scaling.up_threshold {
            return Err("scaling down_threshold must be below up_threshold".into());
        }
        Ok(())
    }
}
