//! Admission control and the cooperative scheduling tick.
//!
//! The scheduler owns the queues and all per-task lifecycle state. Exactly one
//! tick runs at a time; a tick that is due while another is still running is
//! skipped, never queued. Resource grants are delegated to the pool, the
//! single serialization point for capacity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::{DeadlinePolicy, SchedulerConfig, SchedulingAlgorithm};
use crate::core::{
    jain_fairness_index, SchedulerError, SchedulingMetrics, Task, TaskId, TaskResult, TaskState,
};
use crate::pool::{
    AllocationOutcome, AllocationRequest, PoolSnapshot, ResourceAllocation, ResourcePool,
};
use crate::sched::algorithm::order_candidates;
use crate::sched::{QueuedTask, TaskQueue};

/// Why a task was deferred instead of scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// No capacity right now; parked until a tick admits it.
    InsufficientResources,
    /// At least one dependency has not completed.
    DependenciesPending,
}

/// Why a task was rejected at admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Malformed or duplicate submission.
    InvalidTask(String),
    /// The tier queue is at capacity.
    QueueFull(String),
    /// The deadline is unreachable given current queue depth.
    WouldMissDeadline,
    /// Larger than the pool could ever satisfy, even degraded.
    Unsatisfiable,
    /// A dependency reached a failed terminal state.
    DependencyFailed(TaskId),
    /// The scheduler is shutting down.
    Shutdown,
}

/// Typed admission outcome; never an exception across the boundary.
#[derive(Debug, Clone)]
pub enum SchedulingDecision {
    /// Resources reserved; the task may run now.
    Scheduled {
        /// The live allocation backing the admission.
        allocation: ResourceAllocation,
    },
    /// Parked in a queue.
    Deferred {
        /// Why the task is waiting.
        reason: DeferReason,
    },
    /// Refused synchronously.
    Rejected {
        /// Why the task was refused.
        reason: RejectReason,
    },
}

/// Outcome of a cancellation request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The task was queued; removal was synchronous and complete.
    RemovedFromQueue(Box<Task>),
    /// The task is running; cancellation is advisory and the worker must
    /// acknowledge before resources are freed.
    SignalledRunning,
    /// No queued or running task with that id.
    NotFound,
}

/// Bookkeeping for an admitted task.
#[derive(Debug, Clone)]
pub struct RunningEntry {
    /// The immutable submission record.
    pub task: Task,
    /// Allocation backing the admission.
    pub allocation_id: Uuid,
    /// Admission timestamp, milliseconds since epoch.
    pub started_at_ms: u128,
    /// Deadline carried over from the queue entry.
    pub deadline_ms: Option<u128>,
    /// Attempts consumed before this run.
    pub attempts: u32,
}

/// What one tick did; the optimizer acts on the lists.
#[derive(Debug, Default)]
pub struct TickReport {
    /// True when another tick was still running and this one was skipped.
    pub skipped: bool,
    /// Tasks admitted this tick, with their allocations.
    pub admitted: Vec<(Task, ResourceAllocation, u32)>,
    /// Tasks dropped by the deadline policy; to be resolved as timed out.
    pub deadline_dropped: Vec<Task>,
    /// Tasks removed because a dependency failed; to be resolved as failed.
    pub dependency_failed: Vec<(Task, TaskId)>,
    /// Running tasks whose allocations the pool evicted; workers must be
    /// interrupted.
    pub preempt_signals: Vec<TaskId>,
    /// Aging boosts applied this tick.
    pub boosts: u64,
}

struct SchedState {
    queues: Vec<TaskQueue>,
    running: HashMap<TaskId, RunningEntry>,
    completed: HashSet<TaskId>,
    failed: HashSet<TaskId>,
    states: HashMap<TaskId, TaskState>,
    class_vruntime: HashMap<u8, f64>,
    service_ms_by_rank: HashMap<u8, f64>,
    snapshot: PoolSnapshot,
    pending_preempts: Vec<TaskId>,
    shutdown: bool,
}

#[derive(Default)]
struct MetricsState {
    scheduled: u64,
    deferred: u64,
    rejected: u64,
    completed: u64,
    failed: u64,
    sum_wait_ms: f64,
    wait_samples: u64,
    sum_turnaround_ms: f64,
    turnaround_samples: u64,
    sum_exec_ms: f64,
    deadline_tracked: u64,
    deadline_missed: u64,
    preemptions: u64,
    context_switches: u64,
    boosts: u64,
}

/// Task scheduler: admission policy, queues, aging, deadlines, preemption.
pub struct TaskScheduler {
    config: SchedulerConfig,
    pool: Arc<ResourcePool>,
    state: Mutex<SchedState>,
    metrics: Mutex<MetricsState>,
    tick_running: AtomicBool,
    started: Instant,
}

impl TaskScheduler {
    /// Build a scheduler over a pool.
    pub fn new(config: SchedulerConfig, pool: Arc<ResourcePool>) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let mut queues: Vec<TaskQueue> = config.queues.iter().map(TaskQueue::from_spec).collect();
        // Cross-queue admission order: strict tier descending.
        queues.sort_by(|a, b| b.tier.rank().cmp(&a.tier.rank()));
        let snapshot = pool.snapshot();
        Ok(Self {
            config,
            pool,
            state: Mutex::new(SchedState {
                queues,
                running: HashMap::new(),
                completed: HashSet::new(),
                failed: HashSet::new(),
                states: HashMap::new(),
                class_vruntime: HashMap::new(),
                service_ms_by_rank: HashMap::new(),
                snapshot,
                pending_preempts: Vec::new(),
                shutdown: false,
            }),
            metrics: Mutex::new(MetricsState::default()),
            tick_running: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    /// Compute an admission decision for a task. `deadline` is relative to
    /// now; the "would miss deadline" projection runs against current queue
    /// depth before any queue entry is created.
    pub fn schedule_task(&self, task: Task, deadline: Option<Duration>) -> SchedulingDecision {
        let now = crate::util::clock::now_ms();
        let mut state = self.state.lock();

        if state.shutdown {
            return self.reject(RejectReason::Shutdown);
        }
        if state.states.contains_key(&task.id) {
            return self.reject(RejectReason::InvalidTask(format!(
                "task {} already submitted",
                task.id
            )));
        }
        if task.depends_on.contains(&task.id) {
            return self.reject(RejectReason::InvalidTask("task depends on itself".into()));
        }
        if !self.satisfiable(&task) {
            return self.reject(RejectReason::Unsatisfiable);
        }

        let deadline_ms = deadline.map(|d| now + d.as_millis());
        if let Some(deadline_ms) = deadline_ms {
            self.metrics.lock().deadline_tracked += 1;
            if self.projected_finish_ms(&state, &task, now) > deadline_ms {
                self.metrics.lock().deadline_missed += 1;
                return self.reject(RejectReason::WouldMissDeadline);
            }
        }

        if let Some(&failed_dep) = task.depends_on.iter().find(|d| state.failed.contains(*d)) {
            state.states.insert(task.id, TaskState::Failed);
            state.failed.insert(task.id);
            return self.reject(RejectReason::DependencyFailed(failed_dep));
        }
        let deps_ready = task
            .depends_on
            .iter()
            .all(|d| state.completed.contains(d));
        if !deps_ready {
            return match self.enqueue(&mut state, task, now, deadline_ms, 0) {
                Ok(()) => {
                    self.metrics.lock().deferred += 1;
                    SchedulingDecision::Deferred { reason: DeferReason::DependenciesPending }
                }
                Err(name) => self.reject(RejectReason::QueueFull(name)),
            };
        }

        // Dependencies satisfied: try to reserve resources immediately.
        match self.pool.try_allocate(AllocationRequest::from_task(&task)) {
            AllocationOutcome::Granted(allocation) => {
                self.admit(&mut state, task, &allocation, now, deadline_ms, 0);
                self.metrics.lock().scheduled += 1;
                SchedulingDecision::Scheduled { allocation }
            }
            AllocationOutcome::Queued { .. } | AllocationOutcome::Rejected { .. } => {
                match self.enqueue(&mut state, task, now, deadline_ms, 0) {
                    Ok(()) => {
                        self.metrics.lock().deferred += 1;
                        SchedulingDecision::Deferred {
                            reason: DeferReason::InsufficientResources,
                        }
                    }
                    Err(name) => self.reject(RejectReason::QueueFull(name)),
                }
            }
        }
    }

    /// One cooperative scheduling step. Never overlaps with itself; a tick
    /// arriving while another runs is skipped.
    pub fn tick(&self, now_ms: u128) -> TickReport {
        if self
            .tick_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("tick still running, skipping");
            return TickReport { skipped: true, ..TickReport::default() };
        }

        let report = self.run_tick(now_ms);
        self.tick_running.store(false, Ordering::Release);
        report
    }

    fn run_tick(&self, now_ms: u128) -> TickReport {
        let mut report = TickReport::default();
        let mut state = self.state.lock();
        let st = &mut *state;
        st.snapshot = self.pool.snapshot();

        // (1) Aging: boost long-waiting entries to prevent starvation.
        let aging = self.config.aging;
        for queue in &mut st.queues {
            for entry in queue.entries_mut() {
                if entry.boost < aging.max_boost
                    && now_ms.saturating_sub(entry.last_boost_ms)
                        >= u128::from(aging.threshold_ms)
                {
                    entry.boost = (entry.boost + aging.boost_step).min(aging.max_boost);
                    entry.last_boost_ms = now_ms;
                    report.boosts += 1;
                }
            }
        }

        // (2) Deadline scan per policy.
        let policy = self.config.deadline_policy;
        let mut missed_now = 0_u64;
        for queue in &mut st.queues {
            let entries = queue.entries_mut();
            let mut idx = 0;
            while idx < entries.len() {
                let entry = &mut entries[idx];
                let projected_miss = entry.deadline_ms.is_some_and(|d| {
                    now_ms + entry.task.estimated_duration.as_millis() > d
                });
                if projected_miss {
                    match policy {
                        DeadlinePolicy::Drop => {
                            let removed = entries.remove(idx);
                            missed_now += 1;
                            report.deadline_dropped.push(removed.task);
                            continue;
                        }
                        DeadlinePolicy::Continue => {
                            if !entry.miss_counted && entry.deadline_ms.is_some_and(|d| now_ms > d)
                            {
                                entry.miss_counted = true;
                                missed_now += 1;
                            }
                        }
                        DeadlinePolicy::Deprioritize => {
                            if !entry.miss_counted {
                                entry.miss_counted = true;
                                missed_now += 1;
                            }
                            entry.deprioritized = true;
                        }
                    }
                }
                idx += 1;
            }
        }

        // (3) Preemption. Round-robin tiers first: a running task past its
        // time slice yields to waiting peers in the same tier.
        if self.config.preemption_enabled {
            for queue in &st.queues {
                if queue.algorithm != SchedulingAlgorithm::RoundRobin || queue.is_empty() {
                    continue;
                }
                let slice_ms = queue.time_slice.as_millis();
                for (id, entry) in &st.running {
                    if entry.task.priority.rank() == queue.tier.rank()
                        && now_ms.saturating_sub(entry.started_at_ms) >= slice_ms
                        && !st.pending_preempts.contains(id)
                    {
                        st.pending_preempts.push(*id);
                    }
                }
            }
        }

        // Victims evicted by the pool re-enter their queue exactly once; the
        // worker running them must be interrupted.
        let evicted = self.pool.take_preempted();
        let mut preempt_count = 0_u64;
        for task_id in evicted.into_iter().chain(st.pending_preempts.drain(..)) {
            let Some(entry) = st.running.remove(&task_id) else {
                continue;
            };
            preempt_count += 1;
            report.preempt_signals.push(task_id);
            st.states.insert(task_id, TaskState::Preempted);
            let rank = entry.task.priority.rank();
            let mut queued = QueuedTask::new(
                entry.task,
                now_ms,
                entry.deadline_ms,
                class_vruntime(&st.class_vruntime, rank),
            );
            queued.attempts = entry.attempts + 1;
            queued.preempted = true;
            let tier_rank = queued.task.priority.rank();
            if let Some(queue) = pick_queue(&mut st.queues, tier_rank) {
                if queue.push(queued).is_ok() {
                    st.states.insert(task_id, TaskState::Queued);
                } else {
                    tracing::warn!(task = task_id, "preempted task lost: queue full");
                }
            }
        }

        // (4) Admission sweep: tiers descending; within a queue candidates in
        // algorithm order, stopping at the first resource miss (no
        // within-queue backfill). Lower tiers may still attempt admission.
        let mut dep_failed: Vec<(Task, TaskId)> = Vec::new();
        for qi in 0..st.queues.len() {
            let order: Vec<TaskId> = {
                let queue = &st.queues[qi];
                order_candidates(queue.entries(), queue.algorithm, &st.snapshot)
                    .into_iter()
                    .map(|i| queue.entries()[i].task.id)
                    .collect()
            };
            for task_id in order {
                // Dependency gate.
                let dep_status = {
                    let queue = &st.queues[qi];
                    let Some(entry) = queue.entries().iter().find(|e| e.task.id == task_id)
                    else {
                        continue;
                    };
                    if let Some(&failed) = entry
                        .task
                        .depends_on
                        .iter()
                        .find(|d| st.failed.contains(*d))
                    {
                        Some(Err(failed))
                    } else if entry
                        .task
                        .depends_on
                        .iter()
                        .all(|d| st.completed.contains(d))
                    {
                        Some(Ok(()))
                    } else {
                        None
                    }
                };
                match dep_status {
                    Some(Err(failed_dep)) => {
                        if let Some(entry) = st.queues[qi].remove(task_id) {
                            st.states.insert(task_id, TaskState::Failed);
                            st.failed.insert(task_id);
                            dep_failed.push((entry.task, failed_dep));
                        }
                        continue;
                    }
                    None => continue,
                    Some(Ok(())) => {}
                }

                let Some(request) = st.queues[qi]
                    .entries()
                    .iter()
                    .find(|e| e.task.id == task_id)
                    .map(|entry| AllocationRequest::from_task(&entry.task))
                else {
                    continue;
                };
                match self.pool.try_allocate(request) {
                    AllocationOutcome::Granted(allocation) => {
                        let Some(entry) = st.queues[qi].remove(task_id) else {
                            // Should not happen; return the grant.
                            self.pool.release(allocation.id);
                            continue;
                        };
                        let wait = entry.wait_ms(now_ms);
                        let was_preempted = entry.preempted;
                        let attempts = entry.attempts;
                        st.running.insert(
                            task_id,
                            RunningEntry {
                                task: entry.task.clone(),
                                allocation_id: allocation.id,
                                started_at_ms: now_ms,
                                deadline_ms: entry.deadline_ms,
                                attempts,
                            },
                        );
                        st.states.insert(task_id, TaskState::Running);
                        {
                            let mut m = self.metrics.lock();
                            m.scheduled += 1;
                            m.sum_wait_ms += wait as f64;
                            m.wait_samples += 1;
                            if was_preempted {
                                m.context_switches += 1;
                            }
                        }
                        tracing::debug!(task = task_id, wait_ms = wait as u64, "task admitted");
                        report.admitted.push((entry.task, allocation, attempts));
                    }
                    AllocationOutcome::Queued { .. } | AllocationOutcome::Rejected { .. } => {
                        if st.queues[qi].algorithm == SchedulingAlgorithm::RoundRobin {
                            if let Some(entry) = st.queues[qi]
                                .entries_mut()
                                .iter_mut()
                                .find(|e| e.task.id == task_id)
                            {
                                entry.rr_rounds += 1;
                            }
                        }
                        // Head-of-line: stop this queue, move to the next tier.
                        break;
                    }
                }
            }
        }

        for (task, failed_dep) in &dep_failed {
            tracing::warn!(task = task.id, dep = *failed_dep, "dependency failed; task dropped");
        }
        report.dependency_failed = dep_failed;

        {
            let mut m = self.metrics.lock();
            m.boosts += report.boosts;
            m.deadline_missed += missed_now;
            m.preemptions += preempt_count;
        }
        report
    }

    /// Refresh the cached pool snapshot used by admission projections.
    pub fn update_resource_availability(&self, snapshot: PoolSnapshot) {
        self.state.lock().snapshot = snapshot;
    }

    /// Request preemption of a running task. Returns false when the task is
    /// not running. The actual eviction completes on the next tick.
    pub fn preempt_task(&self, task_id: TaskId, reason: &str) -> bool {
        let mut state = self.state.lock();
        if !state.running.contains_key(&task_id) {
            return false;
        }
        tracing::info!(task = task_id, reason, "preemption requested");
        if !state.pending_preempts.contains(&task_id) {
            state.pending_preempts.push(task_id);
        }
        true
    }

    /// Cancel a task. Queued tasks are removed synchronously; running tasks
    /// get an advisory signal and keep resources until acknowledged.
    pub fn cancel_task(&self, task_id: TaskId) -> CancelOutcome {
        let mut state = self.state.lock();
        let st = &mut *state;
        for queue in &mut st.queues {
            if let Some(entry) = queue.remove(task_id) {
                st.states.insert(task_id, TaskState::Cancelled);
                st.failed.insert(task_id);
                tracing::info!(task = task_id, "queued task cancelled");
                return CancelOutcome::RemovedFromQueue(Box::new(entry.task));
            }
        }
        if st.running.contains_key(&task_id) {
            tracing::info!(task = task_id, "advisory cancel for running task");
            return CancelOutcome::SignalledRunning;
        }
        CancelOutcome::NotFound
    }

    /// Record a terminal result. Returns the running entry when the task held
    /// one, so the caller can release its allocation.
    pub fn on_task_finished(&self, result: &TaskResult) -> Option<RunningEntry> {
        let now = crate::util::clock::now_ms();
        let mut state = self.state.lock();
        let entry = state.running.remove(&result.task_id);

        let terminal = match result.outcome {
            crate::core::TaskOutcome::Completed => TaskState::Completed,
            crate::core::TaskOutcome::Failed => TaskState::Failed,
            crate::core::TaskOutcome::TimedOut => TaskState::TimedOut,
            crate::core::TaskOutcome::Cancelled => TaskState::Cancelled,
        };
        state.states.insert(result.task_id, terminal);
        if terminal == TaskState::Completed {
            state.completed.insert(result.task_id);
        } else {
            state.failed.insert(result.task_id);
        }

        let exec_ms = result.execution_time.as_millis() as f64;
        if let Some(entry) = &entry {
            let rank = entry.task.priority.rank();
            *state.service_ms_by_rank.entry(rank).or_insert(0.0) += exec_ms;
            let weight = f64::from(rank) + 1.0;
            *state.class_vruntime.entry(rank).or_insert(0.0) += exec_ms / weight;

            let mut m = self.metrics.lock();
            let turnaround = now.saturating_sub(entry.task.created_at_ms) as f64;
            m.sum_turnaround_ms += turnaround;
            m.turnaround_samples += 1;
            m.sum_exec_ms += exec_ms;
            if let Some(deadline) = entry.deadline_ms {
                if now > deadline {
                    m.deadline_missed += 1;
                }
            }
        }

        let mut m = self.metrics.lock();
        if terminal == TaskState::Completed {
            m.completed += 1;
        } else {
            m.failed += 1;
        }
        drop(m);
        entry
    }

    /// Record an acknowledged preemption: the task re-enters its tier queue
    /// exactly once, with `attempts_consumed` covering the interrupted run,
    /// and no result recorded.
    pub fn on_preempted(&self, task: Task, attempts_consumed: u32, deadline_ms: Option<u128>) {
        let now = crate::util::clock::now_ms();
        let mut state = self.state.lock();
        let st = &mut *state;
        st.running.remove(&task.id);
        let task_id = task.id;
        let rank = task.priority.rank();
        let mut queued = QueuedTask::new(
            task,
            now,
            deadline_ms,
            class_vruntime(&st.class_vruntime, rank),
        );
        queued.attempts = attempts_consumed;
        queued.preempted = true;
        if let Some(queue) = pick_queue(&mut st.queues, rank) {
            if queue.push(queued).is_ok() {
                st.states.insert(task_id, TaskState::Queued);
                self.metrics.lock().preemptions += 1;
            }
        }
    }

    /// Requeue a retryable failed/timed-out task for another attempt. Returns
    /// false when no queue can take it.
    pub fn requeue_for_retry(
        &self,
        task: Task,
        attempts_consumed: u32,
        deadline_ms: Option<u128>,
    ) -> bool {
        let now = crate::util::clock::now_ms();
        let mut state = self.state.lock();
        let st = &mut *state;
        st.running.remove(&task.id);
        let task_id = task.id;
        let rank = task.priority.rank();
        let mut queued = QueuedTask::new(
            task,
            now,
            deadline_ms,
            class_vruntime(&st.class_vruntime, rank),
        );
        queued.attempts = attempts_consumed;
        if let Some(queue) = pick_queue(&mut st.queues, rank) {
            if queue.push(queued).is_ok() {
                st.states.insert(task_id, TaskState::Queued);
                true
            } else {
                false
            }
        } else {
            false
        }
    }

    /// Lifecycle state of a task, if known.
    #[must_use]
    pub fn task_state(&self, task_id: TaskId) -> Option<TaskState> {
        self.state.lock().states.get(&task_id).copied()
    }

    /// Total queued entries across all queues.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.state.lock().queues.iter().map(TaskQueue::len).sum()
    }

    /// Stop accepting new tasks.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
    }

    /// Immutable metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> SchedulingMetrics {
        let state = self.state.lock();
        let m = self.metrics.lock();
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-9);
        let service: Vec<f64> = state.service_ms_by_rank.values().copied().collect();
        SchedulingMetrics {
            scheduled: m.scheduled,
            deferred: m.deferred,
            rejected: m.rejected,
            completed: m.completed,
            failed: m.failed,
            avg_wait_ms: if m.wait_samples == 0 {
                0.0
            } else {
                m.sum_wait_ms / m.wait_samples as f64
            },
            avg_turnaround_ms: if m.turnaround_samples == 0 {
                0.0
            } else {
                m.sum_turnaround_ms / m.turnaround_samples as f64
            },
            throughput_per_sec: m.completed as f64 / elapsed,
            fairness_index: jain_fairness_index(&service),
            deadline_miss_rate: if m.deadline_tracked == 0 {
                0.0
            } else {
                m.deadline_missed as f64 / m.deadline_tracked as f64
            },
            preemptions: m.preemptions,
            context_switches: m.context_switches,
            boosts_applied: m.boosts,
            queue_depths: state
                .queues
                .iter()
                .map(|q| (q.name.clone(), q.len()))
                .collect(),
        }
    }

    // ------------------------------------------------------------------

    fn reject(&self, reason: RejectReason) -> SchedulingDecision {
        self.metrics.lock().rejected += 1;
        tracing::debug!(?reason, "task rejected");
        SchedulingDecision::Rejected { reason }
    }

    /// True when the task could ever be placed, possibly at its degrade
    /// floor. Each axis must fit a single resource, so the bound is the
    /// largest per-axis capacity, not the pool total.
    fn satisfiable(&self, task: &Task) -> bool {
        let snapshot = self.pool.snapshot();
        if snapshot.largest_capacity.meets_minimum(&task.requirements) {
            return true;
        }
        task.min_requirements
            .is_some_and(|floor| snapshot.largest_capacity.meets_minimum(&floor))
    }

    /// Projected completion time: queue depth times mean service time (scaled
    /// by the safety factor), plus the task's own estimate.
    fn projected_finish_ms(&self, state: &SchedState, task: &Task, now_ms: u128) -> u128 {
        let depth: usize = state.queues.iter().map(TaskQueue::len).sum();
        let m = self.metrics.lock();
        let mean_service_ms = if m.completed == 0 {
            task.estimated_duration.as_millis() as f64
        } else {
            m.sum_exec_ms / m.completed as f64
        };
        drop(m);
        let projected_wait =
            depth as f64 * mean_service_ms * self.config.projection_safety_factor;
        now_ms + projected_wait as u128 + task.estimated_duration.as_millis()
    }

    fn enqueue(
        &self,
        state: &mut SchedState,
        task: Task,
        now_ms: u128,
        deadline_ms: Option<u128>,
        attempts: u32,
    ) -> Result<(), String> {
        let task_id = task.id;
        let rank = task.priority.rank();
        let st = &mut *state;
        let mut entry = QueuedTask::new(
            task,
            now_ms,
            deadline_ms,
            class_vruntime(&st.class_vruntime, rank),
        );
        entry.attempts = attempts;
        let Some(queue) = pick_queue(&mut st.queues, rank) else {
            return Err("no queue configured".into());
        };
        let name = queue.name.clone();
        queue.push(entry).map_err(|_| name)?;
        st.states.insert(task_id, TaskState::Queued);
        Ok(())
    }

    fn admit(
        &self,
        state: &mut SchedState,
        task: Task,
        allocation: &ResourceAllocation,
        now_ms: u128,
        deadline_ms: Option<u128>,
        attempts: u32,
    ) {
        let task_id = task.id;
        state.running.insert(
            task_id,
            RunningEntry {
                task,
                allocation_id: allocation.id,
                started_at_ms: now_ms,
                deadline_ms,
                attempts,
            },
        );
        state.states.insert(task_id, TaskState::Running);
    }
}

/// Fair-share entry point: new entries start at their class's accumulated
/// virtual time so they neither starve nor dominate existing waiters.
fn class_vruntime(class_vruntime: &HashMap<u8, f64>, rank: u8) -> f64 {
    class_vruntime.get(&rank).copied().unwrap_or(0.0)
}

/// The queue whose tier matches the rank; falls back to the nearest lower
/// tier, then the last queue.
fn pick_queue(queues: &mut [TaskQueue], rank: u8) -> Option<&mut TaskQueue> {
    let idx = queues
        .iter()
        .position(|q| q.tier.rank() == rank)
        .or_else(|| queues.iter().position(|q| q.tier.rank() < rank))
        .or_else(|| if queues.is_empty() { None } else { Some(queues.len() - 1) })?;
    queues.get_mut(idx)
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("queued", &self.queued_len())
            .finish_non_exhaustive()
    }
}
