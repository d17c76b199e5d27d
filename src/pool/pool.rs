//! The resource pool: authoritative capacity ledger with policy-driven
//! placement, overflow handling, preemption, fairness, defragmentation,
//! elastic scaling, and health checking.
//!
//! The ledger lives behind a single `parking_lot::Mutex`; allocation and
//! release are linearized through it so capacity bookkeeping is race-free.
//! Callers only ever receive cloned records, never references into the ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::config::{
    FairnessPolicy, OverflowPolicy, PoolConfig, ResourceSpec, VictimSelection,
};
use crate::core::{PoolMetrics, ResourceRequirements, SchedulerError, TaskId, TaskPriority, TypeCapacity};
use crate::pool::allocation::select_grants;
use crate::pool::{
    AllocationOutcome, AllocationRequest, HistoryAction, PooledResource, ResourceAllocation,
    ResourceCapacity, ResourceMetadata, ResourceStatus, ResourceType,
};

/// Stride constant; per-tier stride is this over the tier weight.
const STRIDE_UNIT: f64 = 10_000.0;

/// Scheduling weight of a priority tier (higher tier, more service).
fn tier_weight(priority: TaskPriority) -> f64 {
    f64::from(priority.rank()) + 1.0
}

/// A parked allocation request.
struct Waiter {
    request: AllocationRequest,
    enqueued_at_ms: u128,
    expires_at_ms: u128,
}

/// Mutable ledger state, all behind the pool mutex.
struct Ledger {
    resources: HashMap<Uuid, PooledResource>,
    allocations: HashMap<Uuid, ResourceAllocation>,
    waiters: Vec<Waiter>,
    /// Grants produced for waiters, awaiting `poll_ready` claim.
    ready: HashMap<TaskId, ResourceAllocation>,
    /// Tasks whose allocations were evicted; drained by the scheduler.
    preempted: Vec<TaskId>,
    /// Cumulative granted units per priority rank, for fairness ordering.
    service_by_rank: HashMap<u8, f64>,
    /// Stride passes per priority rank.
    stride_pass: HashMap<u8, f64>,
    /// Base instance counts per type, the floor/ceiling anchor for scaling.
    base_counts: HashMap<ResourceType, usize>,
    rng: StdRng,
}

/// Lock-free event counters, exposed only through the metrics snapshot.
#[derive(Default)]
struct PoolCounters {
    granted: AtomicU64,
    released: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
    preempted: AtomicU64,
    degraded: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
}

/// Read-only capacity snapshot handed to the scheduler.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// Total headroom per requirement axis.
    pub available: ResourceRequirements,
    /// Largest single-resource headroom per axis right now.
    pub largest_block: ResourceRequirements,
    /// Largest single-resource capacity per axis regardless of load; the
    /// bound on what could ever be placed.
    pub largest_capacity: ResourceRequirements,
    /// Total capacity per axis.
    pub capacity: ResourceRequirements,
    /// Aggregate utilization in `[0, 1]`.
    pub utilization: f64,
    /// Current wait-queue depth.
    pub wait_queue_depth: usize,
}

impl PoolSnapshot {
    /// True when a requirement fits in the snapshot's largest blocks.
    #[must_use]
    pub fn could_fit(&self, req: &ResourceRequirements) -> bool {
        req.cpu <= self.largest_block.cpu
            && req.memory <= self.largest_block.memory
            && req.io <= self.largest_block.io
            && req.network <= self.largest_block.network
    }

    /// Scarcity of an axis: allocated fraction of its capacity.
    #[must_use]
    pub fn scarcity(&self, kind: ResourceType) -> f64 {
        let cap = kind.axis_amount(&self.capacity);
        if cap <= 0.0 {
            return 0.0;
        }
        (1.0 - kind.axis_amount(&self.available) / cap).clamp(0.0, 1.0)
    }
}

/// Outcome of one defragmentation pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefragReport {
    /// Grants relocated.
    pub migrations: usize,
    /// Fragmentation ratio before the pass.
    pub before: f64,
    /// Fragmentation ratio after the pass.
    pub after: f64,
}

/// Outcome of one health-check round.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthReport {
    /// Resources probed this round.
    pub probed: usize,
    /// Resources newly marked failed.
    pub newly_failed: usize,
    /// Resources recovered to service.
    pub recovered: usize,
}

/// A single elastic scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingEvent {
    /// A resource instance was added.
    ScaledUp(ResourceType),
    /// A resource instance was removed.
    ScaledDown(ResourceType),
}

/// Health probe callback; returns true when the resource is healthy.
pub type HealthProbe = Arc<dyn Fn(&PooledResource) -> bool + Send + Sync>;

/// Resource pool with a serialized capacity ledger.
pub struct ResourcePool {
    name: String,
    config: PoolConfig,
    ledger: Mutex<Ledger>,
    counters: PoolCounters,
    halted: AtomicBool,
    halt_reason: Mutex<Option<String>>,
    fallbacks: Mutex<HashMap<String, Arc<ResourcePool>>>,
    last_scale_ms: AtomicU64,
    probe: RwLock<HealthProbe>,
}

impl ResourcePool {
    /// Build a pool from configuration, creating the resource inventory.
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let mut resources = HashMap::new();
        let mut base_counts = HashMap::new();
        for spec in &config.resources {
            for _ in 0..spec.count {
                let r = Self::resource_from_spec(spec);
                resources.insert(r.id, r);
            }
            *base_counts.entry(spec.kind).or_insert(0) += spec.count;
        }

        let name = name.into();
        tracing::info!(
            pool = %name,
            resources = resources.len(),
            placement = ?config.placement,
            "resource pool initialized"
        );

        Ok(Self {
            name,
            config,
            ledger: Mutex::new(Ledger {
                resources,
                allocations: HashMap::new(),
                waiters: Vec::new(),
                ready: HashMap::new(),
                preempted: Vec::new(),
                service_by_rank: HashMap::new(),
                stride_pass: HashMap::new(),
                base_counts,
                rng: StdRng::seed_from_u64(0x5eed),
            }),
            counters: PoolCounters::default(),
            halted: AtomicBool::new(false),
            halt_reason: Mutex::new(None),
            fallbacks: Mutex::new(HashMap::new()),
            last_scale_ms: AtomicU64::new(0),
            probe: RwLock::new(Arc::new(|_: &PooledResource| true)),
        })
    }

    fn resource_from_spec(spec: &ResourceSpec) -> PooledResource {
        PooledResource::new(
            spec.kind,
            ResourceCapacity {
                value: spec.capacity,
                scalable: spec.scalable,
                max_scale_factor: spec.max_scale_factor,
            },
            ResourceMetadata {
                affinity_tags: spec.affinity_tags.clone(),
                ..ResourceMetadata::default()
            },
        )
    }

    /// Pool name, used for fallback registration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a fallback pool for the `Redirect` overflow policy.
    pub fn register_fallback(&self, pool: Arc<ResourcePool>) {
        self.fallbacks.lock().insert(pool.name().to_string(), pool);
    }

    /// Install a health probe used by `run_health_checks`.
    pub fn set_health_probe(&self, probe: HealthProbe) {
        *self.probe.write() = probe;
    }

    /// True once a ledger invariant violation halted admissions.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Attempt an allocation under the full overflow contract.
    pub fn allocate(&self, request: AllocationRequest) -> AllocationOutcome {
        if self.is_halted() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return AllocationOutcome::Rejected { reason: "pool halted".into() };
        }
        if !request.requirements.is_valid() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return AllocationOutcome::Rejected { reason: "invalid requirements".into() };
        }

        // Overflow resolution for requests with no immediate fit. `Redirect`
        // must run without our ledger lock held.
        enum Overflowed {
            Done(Option<AllocationOutcome>),
            Redirect(String),
        }

        let now = crate::util::clock::now_ms();
        let overflowed = {
            let mut ledger = self.ledger.lock();

            if let Some(allocation) = self.commit_grant(&mut ledger, &request, None, now) {
                Overflowed::Done(Some(AllocationOutcome::Granted(allocation)))
            } else if self.config.preemption.enabled && self.preempt_for(&mut ledger, &request) {
                Overflowed::Done(
                    self.commit_grant(&mut ledger, &request, None, now)
                        .map(AllocationOutcome::Granted),
                )
            } else {
                match &self.config.overflow {
                    OverflowPolicy::Reject => Overflowed::Done(None),
                    OverflowPolicy::Queue => {
                        // Requests larger than the pool could ever satisfy are
                        // rejected, never parked forever.
                        if !self.feasible_when_empty(&ledger, &request.requirements)
                            || ledger.waiters.len() >= self.config.wait_queue_depth
                        {
                            Overflowed::Done(None)
                        } else {
                            let position = self.enqueue_waiter(&mut ledger, request.clone(), now);
                            self.counters.queued.fetch_add(1, Ordering::Relaxed);
                            Overflowed::Done(Some(AllocationOutcome::Queued { position }))
                        }
                    }
                    OverflowPolicy::Degrade => {
                        Overflowed::Done(request.min_requirements.and_then(|floor| {
                            self.commit_grant(&mut ledger, &request, Some(floor), now)
                                .map(|allocation| {
                                    self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                                    AllocationOutcome::Granted(allocation)
                                })
                        }))
                    }
                    OverflowPolicy::Redirect { pool } => Overflowed::Redirect(pool.clone()),
                }
            }
        };

        match overflowed {
            Overflowed::Done(Some(out)) => out,
            Overflowed::Done(None) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(task = request.task_id, "allocation rejected");
                AllocationOutcome::Rejected { reason: "insufficient capacity".into() }
            }
            Overflowed::Redirect(pool) => {
                let fallback = self.fallbacks.lock().get(&pool).cloned();
                fallback.map_or_else(
                    || {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        AllocationOutcome::Rejected {
                            reason: format!("unknown fallback pool `{pool}`"),
                        }
                    },
                    |fb| {
                        tracing::debug!(
                            task = request.task_id,
                            fallback = %fb.name(),
                            "redirecting allocation"
                        );
                        fb.allocate(request.clone())
                    },
                )
            }
        }
    }

    /// Immediate-or-nothing allocation used by the scheduler tick; never
    /// enqueues a waiter, but still honors degrade and preemption policy.
    pub fn try_allocate(&self, request: AllocationRequest) -> AllocationOutcome {
        if self.is_halted() {
            return AllocationOutcome::Rejected { reason: "pool halted".into() };
        }
        let now = crate::util::clock::now_ms();
        let mut ledger = self.ledger.lock();
        if let Some(allocation) = self.commit_grant(&mut ledger, &request, None, now) {
            return AllocationOutcome::Granted(allocation);
        }
        if self.config.preemption.enabled && self.preempt_for(&mut ledger, &request) {
            if let Some(allocation) = self.commit_grant(&mut ledger, &request, None, now) {
                return AllocationOutcome::Granted(allocation);
            }
        }
        if matches!(self.config.overflow, OverflowPolicy::Degrade) {
            if let Some(floor) = request.min_requirements {
                if let Some(allocation) = self.commit_grant(&mut ledger, &request, Some(floor), now)
                {
                    self.counters.degraded.fetch_add(1, Ordering::Relaxed);
                    return AllocationOutcome::Granted(allocation);
                }
            }
        }
        AllocationOutcome::Rejected { reason: "insufficient capacity".into() }
    }

    /// Release an allocation and credit its capacity back. Returns `false`
    /// when the id is unknown (including the second release of the same id).
    pub fn release(&self, allocation_id: Uuid) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(allocation) = ledger.allocations.remove(&allocation_id) else {
            tracing::debug!(%allocation_id, "release of unknown allocation ignored");
            return false;
        };
        for grant in &allocation.grants {
            if let Some(resource) = ledger.resources.get_mut(&grant.resource_id) {
                resource.credit(grant.amount, allocation.task_id, HistoryAction::Released);
            }
        }
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = allocation.task_id, %allocation_id, "allocation released");

        self.check_ledger(&mut ledger);
        self.satisfy_waiters(&mut ledger);
        true
    }

    /// Claim the grant produced for a previously queued request.
    pub fn poll_ready(&self, task_id: TaskId) -> Option<ResourceAllocation> {
        self.ledger.lock().ready.remove(&task_id)
    }

    /// Drop waiters whose timeout elapsed; returns the rejected task ids.
    pub fn prune_waiters(&self, now_ms: u128) -> Vec<TaskId> {
        let mut ledger = self.ledger.lock();
        let mut expired = Vec::new();
        ledger.waiters.retain(|w| {
            if w.expires_at_ms <= now_ms {
                expired.push(w.request.task_id);
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            self.counters
                .rejected
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::warn!(count = expired.len(), "waiters timed out");
        }
        expired
    }

    /// Hand back tasks whose allocations were evicted by preemption.
    pub fn take_preempted(&self) -> Vec<TaskId> {
        std::mem::take(&mut self.ledger.lock().preempted)
    }

    /// Add a resource instance outside the configured inventory.
    pub fn add_resource(&self, spec: &ResourceSpec) -> Uuid {
        let resource = Self::resource_from_spec(spec);
        let id = resource.id;
        let mut ledger = self.ledger.lock();
        ledger.resources.insert(id, resource);
        self.satisfy_waiters(&mut ledger);
        id
    }

    /// Remove a resource carrying no allocations. Returns `false` when the id
    /// is unknown or the resource is still charged.
    pub fn remove_resource(&self, id: Uuid) -> bool {
        let mut ledger = self.ledger.lock();
        match ledger.resources.get(&id) {
            Some(r) if r.allocated == 0.0 => {
                ledger.resources.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Move a resource into or out of maintenance.
    pub fn set_maintenance(&self, id: Uuid, maintenance: bool) -> bool {
        let mut ledger = self.ledger.lock();
        let Some(resource) = ledger.resources.get_mut(&id) else {
            return false;
        };
        resource.status = if maintenance {
            ResourceStatus::Maintenance
        } else if resource.allocated > 0.0 {
            ResourceStatus::Allocated
        } else {
            ResourceStatus::Available
        };
        true
    }

    /// Compact grants onto denser resources to reduce fragmentation. Logical
    /// ownership (allocation → task) never changes, only placement.
    pub fn defragment(&self) -> DefragReport {
        let mut ledger = self.ledger.lock();
        let before = Self::fragmentation_ratio(&ledger.resources);
        let mut migrations = 0_usize;

        if before >= self.config.defrag_threshold {
            // Visit allocations in a stable order; try to move each grant off
            // sparsely used resources onto the densest resource that fits.
            let mut allocation_ids: Vec<Uuid> = ledger.allocations.keys().copied().collect();
            allocation_ids.sort_unstable();

            for alloc_id in allocation_ids {
                let grants = ledger
                    .allocations
                    .get(&alloc_id)
                    .map(|a| a.grants.clone())
                    .unwrap_or_default();
                for (grant_idx, grant) in grants.iter().enumerate() {
                    let source_load = ledger
                        .resources
                        .get(&grant.resource_id)
                        .map_or(0.0, PooledResource::utilization);
                    let target = ledger
                        .resources
                        .values()
                        .filter(|r| {
                            r.kind == grant.kind
                                && r.id != grant.resource_id
                                && r.fits(grant.amount)
                                && r.utilization() > source_load
                        })
                        .max_by(|a, b| {
                            a.utilization()
                                .partial_cmp(&b.utilization())
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .map(|r| r.id);
                    let Some(target_id) = target else { continue };

                    let task_id = ledger.allocations[&alloc_id].task_id;
                    if let Some(src) = ledger.resources.get_mut(&grant.resource_id) {
                        src.credit(grant.amount, task_id, HistoryAction::MigratedOut);
                    }
                    if let Some(dst) = ledger.resources.get_mut(&target_id) {
                        dst.allocated += grant.amount;
                        dst.status = ResourceStatus::Allocated;
                        dst.record(HistoryAction::MigratedIn, Some(task_id), grant.amount);
                    }
                    if let Some(allocation) = ledger.allocations.get_mut(&alloc_id) {
                        allocation.grants[grant_idx].resource_id = target_id;
                    }
                    migrations += 1;
                }
            }
            self.check_ledger(&mut ledger);
        }

        let after = Self::fragmentation_ratio(&ledger.resources);
        if migrations > 0 {
            tracing::info!(migrations, before, after, "defragmentation pass complete");
            self.satisfy_waiters(&mut ledger);
        }
        DefragReport { migrations, before, after }
    }

    /// Probe resources due for a health check; mark failures and recoveries.
    pub fn run_health_checks(&self, now_ms: u128) -> HealthReport {
        let probe = self.probe.read().clone();
        let interval = u128::from(self.config.health.interval_ms);
        let mut ledger = self.ledger.lock();
        let mut report = HealthReport::default();

        let ids: Vec<Uuid> = ledger.resources.keys().copied().collect();
        for id in ids {
            let due = ledger
                .resources
                .get(&id)
                .is_some_and(|r| now_ms.saturating_sub(r.last_check_ms) >= interval);
            if !due {
                continue;
            }
            let healthy = probe(&ledger.resources[&id]);
            let Some(resource) = ledger.resources.get_mut(&id) else {
                continue;
            };
            resource.last_check_ms = now_ms;
            report.probed += 1;

            if healthy {
                if resource.status == ResourceStatus::Failed {
                    resource.consecutive_successes += 1;
                    if resource.consecutive_successes >= self.config.health.recovery_threshold {
                        resource.status = if resource.allocated > 0.0 {
                            ResourceStatus::Allocated
                        } else {
                            ResourceStatus::Available
                        };
                        resource.consecutive_failures = 0;
                        resource.consecutive_successes = 0;
                        resource.record(HistoryAction::Recovered, None, 0.0);
                        report.recovered += 1;
                        tracing::info!(resource = %id, "resource recovered");
                    }
                } else {
                    resource.consecutive_failures = 0;
                }
            } else {
                resource.consecutive_successes = 0;
                resource.consecutive_failures += 1;
                if resource.status.is_placeable()
                    && resource.consecutive_failures >= self.config.health.failure_threshold
                {
                    resource.status = ResourceStatus::Failed;
                    resource.record(HistoryAction::MarkedFailed, None, 0.0);
                    report.newly_failed += 1;
                    tracing::warn!(resource = %id, "resource marked failed");
                }
            }
        }

        if report.recovered > 0 {
            self.satisfy_waiters(&mut ledger);
        }
        report
    }

    /// Evaluate elastic scaling; at most one action per cooldown window.
    pub fn evaluate_scaling(&self, now_ms: u128) -> Option<ScalingEvent> {
        if !self.config.scaling.enabled || self.is_halted() {
            return None;
        }
        let last = u128::from(self.last_scale_ms.load(Ordering::Acquire));
        if now_ms.saturating_sub(last) < u128::from(self.config.scaling.cooldown_ms) {
            return None;
        }

        let mut ledger = self.ledger.lock();
        let utilization = Self::aggregate_utilization(&ledger.resources);

        let event = if utilization > self.config.scaling.up_threshold {
            self.scale_up(&mut ledger)
        } else if utilization < self.config.scaling.down_threshold {
            self.scale_down(&mut ledger)
        } else {
            None
        };

        if let Some(event) = event {
            // Cooldown timestamps are ms-since-epoch; u64 holds until year ~584M.
            self.last_scale_ms
                .store(u64::try_from(now_ms).unwrap_or(u64::MAX), Ordering::Release);
            tracing::info!(?event, utilization, "elastic scaling event");
            if matches!(event, ScalingEvent::ScaledUp(_)) {
                self.satisfy_waiters(&mut ledger);
            }
        }
        event
    }

    /// Immutable metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let ledger = self.ledger.lock();
        let mut by_type: HashMap<ResourceType, TypeCapacity> = HashMap::new();
        let mut unhealthy = 0_usize;
        for r in ledger.resources.values() {
            if matches!(r.status, ResourceStatus::Failed | ResourceStatus::Maintenance) {
                unhealthy += 1;
            }
            let entry = by_type.entry(r.kind).or_default();
            entry.capacity += r.capacity.value;
            entry.allocated += r.allocated;
            entry.available += r.available();
        }
        PoolMetrics {
            by_type,
            utilization: Self::aggregate_utilization(&ledger.resources),
            fragmentation_ratio: Self::fragmentation_ratio(&ledger.resources),
            allocations_granted: self.counters.granted.load(Ordering::Relaxed),
            releases: self.counters.released.load(Ordering::Relaxed),
            allocations_queued: self.counters.queued.load(Ordering::Relaxed),
            allocations_rejected: self.counters.rejected.load(Ordering::Relaxed),
            preemptions: self.counters.preempted.load(Ordering::Relaxed),
            degraded_grants: self.counters.degraded.load(Ordering::Relaxed),
            wait_queue_depth: ledger.waiters.len(),
            scale_ups: self.counters.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.counters.scale_downs.load(Ordering::Relaxed),
            unhealthy_resources: unhealthy,
            halted: self.is_halted(),
        }
    }

    /// Capacity snapshot for the scheduler's admission projections.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let ledger = self.ledger.lock();
        let mut available = ResourceRequirements::default();
        let mut largest = ResourceRequirements::default();
        let mut largest_capacity = ResourceRequirements::default();
        let mut capacity = ResourceRequirements::default();
        for kind in ResourceType::AXES {
            let mut total = 0.0_f64;
            let mut max_block = 0.0_f64;
            let mut max_capacity = 0.0_f64;
            let mut cap = 0.0_f64;
            for r in ledger.resources.values().filter(|r| r.kind == kind) {
                total += r.available();
                max_block = max_block.max(r.available());
                max_capacity = max_capacity.max(r.capacity.value);
                if r.status.is_placeable() {
                    cap += r.capacity.value;
                }
            }
            let (a, l, lc, c) = match kind {
                ResourceType::CpuCore => (
                    &mut available.cpu,
                    &mut largest.cpu,
                    &mut largest_capacity.cpu,
                    &mut capacity.cpu,
                ),
                ResourceType::MemoryBlock => (
                    &mut available.memory,
                    &mut largest.memory,
                    &mut largest_capacity.memory,
                    &mut capacity.memory,
                ),
                ResourceType::IoChannel => (
                    &mut available.io,
                    &mut largest.io,
                    &mut largest_capacity.io,
                    &mut capacity.io,
                ),
                ResourceType::NetworkBandwidth
                | ResourceType::WorkerThread
                | ResourceType::ComputeUnit => (
                    &mut available.network,
                    &mut largest.network,
                    &mut largest_capacity.network,
                    &mut capacity.network,
                ),
            };
            *a = total;
            *l = max_block;
            *lc = max_capacity;
            *c = cap;
        }
        PoolSnapshot {
            available,
            largest_block: largest,
            largest_capacity,
            capacity,
            utilization: Self::aggregate_utilization(&ledger.resources),
            wait_queue_depth: ledger.waiters.len(),
        }
    }

    /// Verify ledger invariants; on violation halt admissions.
    pub fn verify(&self) -> Result<(), SchedulerError> {
        let mut ledger = self.ledger.lock();
        self.check_ledger(&mut ledger);
        if self.is_halted() {
            let reason = self
                .halt_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "ledger invariant violated".into());
            return Err(SchedulerError::PoolHalted(reason));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internal ledger operations (callers hold the ledger lock).
    // ------------------------------------------------------------------

    /// Try to place and commit a grant. `degraded_to` substitutes the
    /// requirement while keeping the original on record.
    fn commit_grant(
        &self,
        ledger: &mut Ledger,
        request: &AllocationRequest,
        degraded_to: Option<ResourceRequirements>,
        now_ms: u128,
    ) -> Option<ResourceAllocation> {
        let effective = degraded_to.unwrap_or(request.requirements);
        let grants = select_grants(
            &ledger.resources,
            &effective,
            &request.affinity_tags,
            self.config.placement,
        )?;
        for grant in &grants {
            if let Some(resource) = ledger.resources.get_mut(&grant.resource_id) {
                resource.charge(grant.amount, request.task_id);
            }
        }
        let allocation = ResourceAllocation {
            id: Uuid::new_v4(),
            task_id: request.task_id,
            grants,
            requirements: effective,
            granted_at_ms: now_ms,
            expires_at_ms: None,
            priority: request.priority,
            preemptable: request.preemptable,
        };
        ledger
            .allocations
            .insert(allocation.id, allocation.clone());
        *ledger
            .service_by_rank
            .entry(request.priority.rank())
            .or_insert(0.0) += allocation.total_units();
        self.counters.granted.fetch_add(1, Ordering::Relaxed);
        self.check_ledger(ledger);
        tracing::debug!(
            task = request.task_id,
            allocation = %allocation.id,
            degraded = degraded_to.is_some(),
            "allocation granted"
        );
        Some(allocation)
    }

    /// True when the request could fit an empty pool; guards the wait queue
    /// against permanently unsatisfiable entries.
    fn feasible_when_empty(&self, ledger: &Ledger, req: &ResourceRequirements) -> bool {
        for kind in ResourceType::AXES {
            let amount = kind.axis_amount(req);
            if amount <= 0.0 {
                continue;
            }
            let max_capacity = ledger
                .resources
                .values()
                .filter(|r| r.kind == kind)
                .map(|r| r.capacity.value)
                .fold(0.0_f64, f64::max);
            if amount > max_capacity {
                return false;
            }
        }
        true
    }

    /// Insert a waiter keeping the queue ordered by priority, FIFO within a
    /// rank; returns the insertion position.
    fn enqueue_waiter(
        &self,
        ledger: &mut Ledger,
        request: AllocationRequest,
        now_ms: u128,
    ) -> usize {
        let expires_at_ms = now_ms + u128::from(self.config.wait_timeout_ms);
        let rank = request.priority.rank();
        let position = ledger
            .waiters
            .iter()
            .position(|w| w.request.priority.rank() < rank)
            .unwrap_or(ledger.waiters.len());
        ledger.waiters.insert(
            position,
            Waiter { request, enqueued_at_ms: now_ms, expires_at_ms },
        );
        position
    }

    /// Evict preemptable lower-priority allocations until the request fits.
    /// Victims are recorded for the scheduler to requeue; returns whether any
    /// eviction happened.
    fn preempt_for(&self, ledger: &mut Ledger, request: &AllocationRequest) -> bool {
        let rank = request.priority.rank();
        let mut evicted_any = false;
        loop {
            if select_grants(
                &ledger.resources,
                &request.requirements,
                &request.affinity_tags,
                self.config.placement,
            )
            .is_some()
            {
                return evicted_any;
            }
            let Some(victim_id) = self.pick_victim(ledger, rank) else {
                return evicted_any;
            };
            let Some(victim) = ledger.allocations.remove(&victim_id) else {
                return evicted_any;
            };
            for grant in &victim.grants {
                if let Some(resource) = ledger.resources.get_mut(&grant.resource_id) {
                    resource.credit(grant.amount, victim.task_id, HistoryAction::Preempted);
                }
            }
            tracing::info!(
                victim_task = victim.task_id,
                for_task = request.task_id,
                "allocation preempted"
            );
            ledger.preempted.push(victim.task_id);
            self.counters.preempted.fetch_add(1, Ordering::Relaxed);
            evicted_any = true;
        }
    }

    /// Victim selection per policy; ties break by oldest grant, then id.
    fn pick_victim(&self, ledger: &Ledger, requester_rank: u8) -> Option<Uuid> {
        let candidates = ledger
            .allocations
            .values()
            .filter(|a| a.preemptable && a.priority.rank() < requester_rank);

        let key = |a: &ResourceAllocation| -> (f64, u128, Uuid) {
            let score = match self.config.preemption.victim {
                VictimSelection::LowestPriority => f64::from(a.priority.rank()),
                VictimSelection::LeastRecentlyUsed => a.granted_at_ms as f64,
                VictimSelection::HighestPressure => -a.total_units(),
            };
            (score, a.granted_at_ms, a.id)
        };

        candidates
            .min_by(|a, b| {
                key(a)
                    .partial_cmp(&key(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|a| a.id)
    }

    /// Grant as many waiters as now fit, ordered by the fairness policy.
    fn satisfy_waiters(&self, ledger: &mut Ledger) {
        loop {
            // Indices of waiters whose requirements fit right now.
            let satisfiable: Vec<usize> = ledger
                .waiters
                .iter()
                .enumerate()
                .filter(|(_, w)| {
                    select_grants(
                        &ledger.resources,
                        &w.request.requirements,
                        &w.request.affinity_tags,
                        self.config.placement,
                    )
                    .is_some()
                })
                .map(|(i, _)| i)
                .collect();
            if satisfiable.is_empty() {
                return;
            }

            let chosen = self.pick_fair(ledger, &satisfiable);
            let waiter = ledger.waiters.remove(chosen);
            let now = crate::util::clock::now_ms();
            if let Some(allocation) = self.commit_grant(ledger, &waiter.request, None, now) {
                tracing::debug!(
                    task = waiter.request.task_id,
                    waited_ms = (now.saturating_sub(waiter.enqueued_at_ms)) as u64,
                    "waiter satisfied"
                );
                ledger.ready.insert(waiter.request.task_id, allocation);
            }
        }
    }

    /// Choose among satisfiable waiter indices per the fairness policy.
    fn pick_fair(&self, ledger: &mut Ledger, satisfiable: &[usize]) -> usize {
        match self.config.fairness {
            FairnessPolicy::ProportionalShare => *satisfiable
                .iter()
                .min_by(|&&a, &&b| {
                    let ra = Self::normalized_service(ledger, ledger.waiters[a].request.priority);
                    let rb = Self::normalized_service(ledger, ledger.waiters[b].request.priority);
                    ra.partial_cmp(&rb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.cmp(&b))
                })
                .unwrap_or(&0),
            FairnessPolicy::Lottery => {
                let total: f64 = satisfiable
                    .iter()
                    .map(|&i| tier_weight(ledger.waiters[i].request.priority))
                    .sum();
                let mut draw = ledger.rng.random_range(0.0..total.max(f64::MIN_POSITIVE));
                for &i in satisfiable {
                    let w = tier_weight(ledger.waiters[i].request.priority);
                    if draw < w {
                        return i;
                    }
                    draw -= w;
                }
                satisfiable[satisfiable.len() - 1]
            }
            FairnessPolicy::Stride => {
                let chosen = *satisfiable
                    .iter()
                    .min_by(|&&a, &&b| {
                        let pa = Self::stride_pass(ledger, ledger.waiters[a].request.priority);
                        let pb = Self::stride_pass(ledger, ledger.waiters[b].request.priority);
                        pa.partial_cmp(&pb)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.cmp(&b))
                    })
                    .unwrap_or(&0);
                let priority = ledger.waiters[chosen].request.priority;
                let pass = ledger.stride_pass.entry(priority.rank()).or_insert(0.0);
                *pass += STRIDE_UNIT / tier_weight(priority);
                chosen
            }
        }
    }

    fn normalized_service(ledger: &Ledger, priority: TaskPriority) -> f64 {
        ledger
            .service_by_rank
            .get(&priority.rank())
            .copied()
            .unwrap_or(0.0)
            / tier_weight(priority)
    }

    fn stride_pass(ledger: &Ledger, priority: TaskPriority) -> f64 {
        ledger
            .stride_pass
            .get(&priority.rank())
            .copied()
            .unwrap_or(0.0)
    }

    fn scale_up(&self, ledger: &mut Ledger) -> Option<ScalingEvent> {
        for spec in self.config.resources.iter().filter(|s| s.scalable) {
            let base = ledger.base_counts.get(&spec.kind).copied().unwrap_or(0);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let ceiling = ((base as f64) * spec.max_scale_factor).floor() as usize;
            let current = ledger
                .resources
                .values()
                .filter(|r| r.kind == spec.kind)
                .count();
            if current < ceiling {
                let resource = Self::resource_from_spec(spec);
                ledger.resources.insert(resource.id, resource);
                self.counters.scale_ups.fetch_add(1, Ordering::Relaxed);
                return Some(ScalingEvent::ScaledUp(spec.kind));
            }
        }
        None
    }

    fn scale_down(&self, ledger: &mut Ledger) -> Option<ScalingEvent> {
        for spec in self.config.resources.iter().filter(|s| s.scalable) {
            let base = ledger.base_counts.get(&spec.kind).copied().unwrap_or(0);
            let current = ledger
                .resources
                .values()
                .filter(|r| r.kind == spec.kind)
                .count();
            if current <= base {
                continue;
            }
            let idle = ledger
                .resources
                .values()
                .find(|r| r.kind == spec.kind && r.capacity.scalable && r.allocated == 0.0)
                .map(|r| r.id);
            if let Some(id) = idle {
                ledger.resources.remove(&id);
                self.counters.scale_downs.fetch_add(1, Ordering::Relaxed);
                return Some(ScalingEvent::ScaledDown(spec.kind));
            }
        }
        None
    }

    /// Cheap per-operation invariant check; halts the pool on violation
    /// instead of continuing with an inconsistent ledger.
    fn check_ledger(&self, ledger: &mut Ledger) {
        const EPS: f64 = 1e-6;
        let mut billed: HashMap<Uuid, f64> = HashMap::new();
        for allocation in ledger.allocations.values() {
            for grant in &allocation.grants {
                *billed.entry(grant.resource_id).or_insert(0.0) += grant.amount;
            }
        }
        for resource in ledger.resources.values() {
            if resource.allocated < -EPS
                || resource.allocated > resource.capacity.value * resource.capacity.max_scale_factor + EPS
            {
                self.halt(format!(
                    "resource {} allocated {} outside [0, {}]",
                    resource.id,
                    resource.allocated,
                    resource.capacity.value * resource.capacity.max_scale_factor
                ));
                return;
            }
            let expected = billed.get(&resource.id).copied().unwrap_or(0.0);
            if (resource.allocated - expected).abs() > EPS {
                self.halt(format!(
                    "resource {} ledger drift: billed {} vs recorded {}",
                    resource.id, expected, resource.allocated
                ));
                return;
            }
        }
        for (resource_id, amount) in billed {
            if !ledger.resources.contains_key(&resource_id) && amount > EPS {
                self.halt(format!("grant references unknown resource {resource_id}"));
                return;
            }
        }
    }

    fn halt(&self, reason: String) {
        if !self.halted.swap(true, Ordering::AcqRel) {
            tracing::error!(%reason, "ledger corruption detected; pool halted");
            *self.halt_reason.lock() = Some(reason);
        }
    }

    fn aggregate_utilization(resources: &HashMap<Uuid, PooledResource>) -> f64 {
        let mut capacity = 0.0_f64;
        let mut allocated = 0.0_f64;
        for r in resources.values().filter(|r| r.status.is_placeable()) {
            capacity += r.capacity.value;
            allocated += r.allocated;
        }
        if capacity <= 0.0 {
            0.0
        } else {
            (allocated / capacity).clamp(0.0, 1.0)
        }
    }

    /// Fraction of free capacity stranded in blocks smaller than the largest
    /// free block, averaged across types weighted by free capacity.
    fn fragmentation_ratio(resources: &HashMap<Uuid, PooledResource>) -> f64 {
        let mut stranded = 0.0_f64;
        let mut free_total = 0.0_f64;
        for kind in ResourceType::AXES {
            let free: Vec<f64> = resources
                .values()
                .filter(|r| r.kind == kind)
                .map(PooledResource::available)
                .filter(|f| *f > 0.0)
                .collect();
            if free.is_empty() {
                continue;
            }
            let total: f64 = free.iter().sum();
            let largest = free.iter().fold(0.0_f64, |a, &b| a.max(b));
            stranded += total - largest;
            free_total += total;
        }
        if free_total <= 0.0 {
            0.0
        } else {
            (stranded / free_total).clamp(0.0, 1.0)
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}
