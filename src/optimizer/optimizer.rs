//! The parallel optimizer: submission facade, plan execution, completion
//! handling, and the adaptive concurrency loop.
//!
//! Control flow: `submit_task` → scheduler admission → worker execution →
//! completion event → release resources, update scheduler state, resolve the
//! caller's completion slot (or retry/requeue). Background loops drive the
//! scheduler tick and the adaptive sampling.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::ConductorConfig;
use crate::core::{
    OptimizationMetrics, ProcessorRegistry, ResourceUsage, SchedulerError, Task, TaskId,
    TaskOutcome, TaskResult,
};
use crate::optimizer::plan::build_plan;
use crate::optimizer::worker::{
    AttemptOutcome, CompletionEvent, ExecutableTask, InterruptKind, WorkerPool,
};
use crate::optimizer::{CompletionHub, ParallelizationPlan};
use crate::pool::ResourcePool;
use crate::runtime::Spawn;
use crate::sched::{CancelOutcome, RejectReason, SchedulingDecision, TaskScheduler};

#[derive(Default)]
struct OptCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    scale_ups: AtomicU64,
    scale_downs: AtomicU64,
    sum_exec_us: AtomicU64,
    above_samples: AtomicU32,
    below_samples: AtomicU32,
    last_adjust_ms: AtomicU64,
}

/// Parallel optimizer over a pool, a scheduler, and a bounded worker pool.
pub struct ParallelOptimizer<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    config: ConductorConfig,
    pool: Arc<ResourcePool>,
    scheduler: Arc<TaskScheduler>,
    workers: Arc<WorkerPool>,
    hub: Arc<CompletionHub>,
    registry: ProcessorRegistry,
    spawner: S,
    next_task_id: AtomicU64,
    max_concurrency: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    counters: OptCounters,
    completion_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<CompletionEvent>>>,
    last_plan_speedup: Mutex<f64>,
}

impl<S> ParallelOptimizer<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Build the optimizer and start its background loops on the spawner's
    /// runtime.
    pub fn new(
        config: ConductorConfig,
        registry: ProcessorRegistry,
        spawner: S,
    ) -> Result<Arc<Self>, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let pool = Arc::new(ResourcePool::new("primary", config.pool.clone())?);
        let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone(), Arc::clone(&pool))?);
        let initial = config
            .optimizer
            .initial_concurrency
            .clamp(config.optimizer.min_workers, config.optimizer.max_workers);
        let max_concurrency = Arc::new(AtomicUsize::new(initial));
        let (completion_tx, completion_rx) = tokio::sync::mpsc::unbounded_channel();
        let workers = Arc::new(WorkerPool::new(
            &config.optimizer,
            registry.clone(),
            completion_tx,
            Arc::clone(&max_concurrency),
        )?);

        let optimizer = Arc::new(Self {
            config,
            pool,
            scheduler,
            workers,
            hub: Arc::new(CompletionHub::new()),
            registry,
            spawner,
            next_task_id: AtomicU64::new(0),
            max_concurrency,
            shutdown: Arc::new(AtomicBool::new(false)),
            counters: OptCounters::default(),
            completion_rx: Mutex::new(Some(completion_rx)),
            last_plan_speedup: Mutex::new(1.0),
        });
        optimizer.start();
        Ok(optimizer)
    }

    fn start(self: &Arc<Self>) {
        // Completion drain: one event at a time, then a tick so freed
        // capacity admits the next waiter promptly.
        let drain = Arc::clone(self);
        let mut rx = self
            .completion_rx
            .lock()
            .take()
            .unwrap_or_else(|| tokio::sync::mpsc::unbounded_channel().1);
        self.spawner.spawn(async move {
            while let Some(event) = rx.recv().await {
                Self::handle_completion(&drain, event);
                drain.run_scheduler_tick();
            }
            tracing::debug!("completion drain loop exited");
        });

        // Periodic scheduler tick.
        let ticker = Arc::clone(self);
        let tick_interval = Duration::from_millis(self.config.optimizer.tick_interval_ms);
        self.spawner.spawn(async move {
            while !ticker.shutdown.load(Ordering::Acquire) {
                tokio::time::sleep(tick_interval).await;
                ticker.run_scheduler_tick();
            }
        });

        // Adaptive sampling loop.
        if self.config.optimizer.scaling.enabled {
            let sampler = Arc::clone(self);
            let interval = Duration::from_millis(self.config.optimizer.scaling.sample_interval_ms);
            self.spawner.spawn(async move {
                while !sampler.shutdown.load(Ordering::Acquire) {
                    tokio::time::sleep(interval).await;
                    sampler.sample_load();
                }
            });
        }
    }

    /// Reserve a task id for batch construction, so dependent tasks in one
    /// batch can reference each other before submission.
    pub fn allocate_task_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Submit a task for execution. Validation is synchronous; completion is
    /// retrieved through [`ParallelOptimizer::wait_for_task`].
    pub fn submit_task(&self, task: Task) -> Result<TaskId, SchedulerError> {
        self.submit_task_with_deadline(task, None)
    }

    /// Submit with a completion deadline relative to now; admission rejects
    /// deadlines the current backlog makes unreachable.
    pub fn submit_task_with_deadline(
        &self,
        mut task: Task,
        deadline: Option<Duration>,
    ) -> Result<TaskId, SchedulerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }
        if !self.registry.supports(task.kind) {
            return Err(SchedulerError::InvalidTask(format!(
                "no processor registered for {:?}",
                task.kind
            )));
        }
        if task.id == 0 {
            task.id = self.allocate_task_id();
        }
        let task_id = task.id;
        self.hub.create_slot(task_id);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        match self.scheduler.schedule_task(task.clone(), deadline) {
            SchedulingDecision::Scheduled { allocation } => {
                tracing::debug!(task = task_id, "scheduled immediately");
                self.dispatch(task, allocation.id, 0);
                Ok(task_id)
            }
            SchedulingDecision::Deferred { reason } => {
                tracing::debug!(task = task_id, ?reason, "deferred");
                Ok(task_id)
            }
            SchedulingDecision::Rejected { reason } => {
                self.hub.remove(task_id);
                Err(reject_to_error(&reason))
            }
        }
    }

    /// Wait for a task's terminal result, failing after `timeout`.
    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<TaskResult, SchedulerError> {
        self.hub.wait(task_id, timeout).await
    }

    /// Compute a parallelization plan for a batch against the current pool
    /// snapshot. Pure; nothing is submitted.
    pub fn generate_plan(&self, tasks: &[Task]) -> Result<ParallelizationPlan, SchedulerError> {
        let plan = build_plan(
            tasks,
            &self.pool.snapshot(),
            self.max_concurrency.load(Ordering::Acquire),
        )?;
        *self.last_plan_speedup.lock() = plan.speedup;
        Ok(plan)
    }

    /// Execute a plan: groups run in dependency order, parallel groups fan
    /// out, non-parallel groups run their members one at a time. Tasks must
    /// carry the ids the plan was built from (use
    /// [`ParallelOptimizer::allocate_task_id`] when building the batch).
    pub async fn execute_plan(
        &self,
        plan: &ParallelizationPlan,
        tasks: &[Task],
    ) -> Result<Vec<TaskResult>, SchedulerError> {
        let find = |id: TaskId| -> Result<&Task, SchedulerError> {
            tasks
                .iter()
                .find(|t| t.id == id)
                .ok_or(SchedulerError::UnknownTask(id))
        };
        for task in tasks {
            if task.id == 0 {
                return Err(SchedulerError::InvalidTask(
                    "plan tasks need pre-assigned ids".into(),
                ));
            }
        }

        let mut results = Vec::with_capacity(tasks.len());
        for group in &plan.groups {
            if group.parallel_executable {
                for &id in &group.task_ids {
                    self.submit_task(find(id)?.clone())?;
                }
                for &id in &group.task_ids {
                    let bound = wait_bound(find(id)?);
                    results.push(self.wait_for_task(id, bound).await?);
                }
            } else {
                // Exclusive-access group: strictly one member at a time.
                for &id in &group.task_ids {
                    let task = find(id)?.clone();
                    let bound = wait_bound(&task);
                    self.submit_task(task)?;
                    results.push(self.wait_for_task(id, bound).await?);
                }
            }
        }
        Ok(results)
    }

    /// Cancel a task: queued tasks resolve as cancelled immediately; running
    /// tasks get an advisory interrupt.
    pub fn cancel_task(&self, task_id: TaskId) -> bool {
        match self.scheduler.cancel_task(task_id) {
            CancelOutcome::RemovedFromQueue(_) => {
                let result = TaskResult::cancelled(task_id);
                self.scheduler.on_task_finished(&result);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                self.hub.resolve(result);
                true
            }
            CancelOutcome::SignalledRunning => {
                self.workers.interrupt(task_id, InterruptKind::Cancel)
            }
            CancelOutcome::NotFound => false,
        }
    }

    /// Request preemption of a running task; the eviction completes on the
    /// next tick and the task re-enters its queue.
    pub fn preempt_task(&self, task_id: TaskId, reason: &str) -> bool {
        self.scheduler.preempt_task(task_id, reason)
    }

    /// Run one scheduler tick now (also driven periodically in the
    /// background).
    pub fn run_scheduler_tick(&self) {
        let now = crate::util::clock::now_ms();
        let report = self.scheduler.tick(now);
        if report.skipped {
            return;
        }

        for task_id in report.preempt_signals {
            self.workers.interrupt(task_id, InterruptKind::Preempt);
        }
        for task in report.deadline_dropped {
            let result = TaskResult {
                task_id: task.id,
                outcome: TaskOutcome::TimedOut,
                value: None,
                error: Some("deadline missed while queued".into()),
                execution_time: Duration::ZERO,
                usage: ResourceUsage::default(),
                worker_id: None,
                attempts: 0,
            };
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            self.scheduler.on_task_finished(&result);
            self.hub.resolve(result);
        }
        for (task, failed_dep) in report.dependency_failed {
            let result = TaskResult::failed(
                task.id,
                format!("dependency {failed_dep} failed"),
                0,
            );
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.scheduler.on_task_finished(&result);
            self.hub.resolve(result);
        }
        for (task, allocation, attempts) in report.admitted {
            self.dispatch(task, allocation.id, attempts);
        }
    }

    /// Immutable metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> OptimizationMetrics {
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let sum_exec_us = self.counters.sum_exec_us.load(Ordering::Relaxed);
        OptimizationMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed,
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            running: self.workers.active_tasks(),
            max_concurrency: self.max_concurrency.load(Ordering::Relaxed),
            worker_count: self.workers.worker_count(),
            avg_execution_ms: if completed == 0 {
                0.0
            } else {
                sum_exec_us as f64 / 1_000.0 / completed as f64
            },
            scale_ups: self.counters.scale_ups.load(Ordering::Relaxed),
            scale_downs: self.counters.scale_downs.load(Ordering::Relaxed),
            last_plan_speedup: *self.last_plan_speedup.lock(),
        }
    }

    /// The underlying resource pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// The underlying scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Stop accepting work and shut the workers down.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("optimizer shutting down");
        self.scheduler.shutdown();
        self.workers.shutdown();
    }

    // ------------------------------------------------------------------

    fn dispatch(&self, task: Task, allocation_id: Uuid, prior_attempts: u32) {
        let task_id = task.id;
        let exec = ExecutableTask { task: task.clone(), allocation_id, attempt: prior_attempts + 1 };
        if let Err(e) = self.workers.submit(exec) {
            tracing::error!(task = task_id, error = %e, "dispatch failed");
            self.pool.release(allocation_id);
            let result =
                TaskResult::failed(task_id, format!("dispatch failed: {e}"), prior_attempts);
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            self.scheduler.on_task_finished(&result);
            self.hub.resolve(result);
        }
    }

    fn handle_completion(this: &Arc<Self>, event: CompletionEvent) {
        // Release first; preempted allocations were already evicted and the
        // second release is a structural no-op.
        this.pool.release(event.allocation_id);

        let CompletionEvent { task, attempt, outcome, execution_time, worker_id, .. } = event;
        match outcome {
            AttemptOutcome::Completed { value } => {
                this.counters.completed.fetch_add(1, Ordering::Relaxed);
                this.counters.sum_exec_us.fetch_add(
                    u64::try_from(execution_time.as_micros()).unwrap_or(u64::MAX),
                    Ordering::Relaxed,
                );
                let result = TaskResult {
                    task_id: task.id,
                    outcome: TaskOutcome::Completed,
                    value: Some(value),
                    error: None,
                    execution_time,
                    usage: task.requirements,
                    worker_id: Some(worker_id),
                    attempts: attempt,
                };
                this.scheduler.on_task_finished(&result);
                this.hub.resolve(result);
            }
            AttemptOutcome::Failed { error, retryable } => {
                if retryable && attempt <= task.max_retries {
                    Self::retry(this, task, attempt, &error);
                } else {
                    let result = TaskResult {
                        task_id: task.id,
                        outcome: TaskOutcome::Failed,
                        value: None,
                        error: Some(error),
                        execution_time,
                        usage: task.requirements,
                        worker_id: Some(worker_id),
                        attempts: attempt,
                    };
                    this.counters.failed.fetch_add(1, Ordering::Relaxed);
                    this.scheduler.on_task_finished(&result);
                    this.hub.resolve(result);
                }
            }
            AttemptOutcome::TimedOut => {
                if attempt <= task.max_retries {
                    Self::retry(this, task, attempt, "attempt timed out");
                } else {
                    let result = TaskResult {
                        task_id: task.id,
                        outcome: TaskOutcome::TimedOut,
                        value: None,
                        error: Some("task timed out".into()),
                        execution_time,
                        usage: task.requirements,
                        worker_id: Some(worker_id),
                        attempts: attempt,
                    };
                    this.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    this.scheduler.on_task_finished(&result);
                    this.hub.resolve(result);
                }
            }
            AttemptOutcome::Cancelled => {
                let mut result = TaskResult::cancelled(task.id);
                result.execution_time = execution_time;
                result.attempts = attempt;
                result.worker_id = Some(worker_id);
                this.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                this.scheduler.on_task_finished(&result);
                this.hub.resolve(result);
            }
            AttemptOutcome::Preempted => {
                // No result: the task re-enters its queue with the attempt
                // counter incremented.
                tracing::info!(task = task.id, attempt, "attempt preempted, requeued");
                this.scheduler.on_preempted(task, attempt, None);
            }
        }
    }

    fn retry(this: &Arc<Self>, task: Task, attempts_consumed: u32, cause: &str) {
        this.counters.retries.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            task = task.id,
            attempt = attempts_consumed,
            cause,
            "retrying task"
        );
        let backoff = Duration::from_millis(this.config.optimizer.retry_backoff_ms);
        let this = Arc::clone(this);
        let spawner = this.spawner.clone();
        spawner.spawn(async move {
            tokio::time::sleep(backoff).await;
            let task_id = task.id;
            if !this.scheduler.requeue_for_retry(task, attempts_consumed, None) {
                let result = TaskResult::failed(
                    task_id,
                    "retry requeue failed: queue full",
                    attempts_consumed,
                );
                this.counters.failed.fetch_add(1, Ordering::Relaxed);
                this.scheduler.on_task_finished(&result);
                this.hub.resolve(result);
            }
        });
    }

    /// One adaptive sample: refresh the scheduler's snapshot, adjust the
    /// concurrency bound under sustained load, and run pool upkeep.
    fn sample_load(&self) {
        let now = crate::util::clock::now_ms();
        let snapshot = self.pool.snapshot();
        self.scheduler.update_resource_availability(snapshot.clone());
        let queued = self.scheduler.queued_len();

        let scaling = self.config.optimizer.scaling;
        let queue_pressure =
            queued as f64 / (self.config.optimizer.max_workers * 4) as f64;
        let load = snapshot.utilization.max(queue_pressure.min(1.0));

        if load > scaling.up_threshold {
            self.counters.above_samples.fetch_add(1, Ordering::Relaxed);
            self.counters.below_samples.store(0, Ordering::Relaxed);
        } else if load < scaling.down_threshold {
            self.counters.below_samples.fetch_add(1, Ordering::Relaxed);
            self.counters.above_samples.store(0, Ordering::Relaxed);
        } else {
            self.counters.above_samples.store(0, Ordering::Relaxed);
            self.counters.below_samples.store(0, Ordering::Relaxed);
        }

        let last = self.counters.last_adjust_ms.load(Ordering::Acquire);
        let cooled = now.saturating_sub(u128::from(last)) >= u128::from(scaling.cooldown_ms);
        let current = self.max_concurrency.load(Ordering::Acquire);

        if cooled
            && self.counters.above_samples.load(Ordering::Relaxed) >= scaling.sustained_samples
            && current < self.config.optimizer.max_workers
        {
            let next = current + 1;
            self.workers.set_max_concurrency(next);
            self.counters.scale_ups.fetch_add(1, Ordering::Relaxed);
            self.counters.above_samples.store(0, Ordering::Relaxed);
            self.counters
                .last_adjust_ms
                .store(u64::try_from(now).unwrap_or(u64::MAX), Ordering::Release);
            tracing::info!(max_concurrency = next, load, "scaled concurrency up");
        } else if cooled
            && self.counters.below_samples.load(Ordering::Relaxed) >= scaling.sustained_samples
            && current > self.config.optimizer.min_workers
        {
            let next = current - 1;
            self.workers.set_max_concurrency(next);
            self.counters.scale_downs.fetch_add(1, Ordering::Relaxed);
            self.counters.below_samples.store(0, Ordering::Relaxed);
            self.counters
                .last_adjust_ms
                .store(u64::try_from(now).unwrap_or(u64::MAX), Ordering::Release);
            tracing::info!(max_concurrency = next, load, "scaled concurrency down");
        }

        // Pool-side upkeep: elastic sizing, health probes, waiter timeouts,
        // and threshold-gated defragmentation.
        self.pool.evaluate_scaling(now);
        self.pool.run_health_checks(now);
        self.pool.prune_waiters(now);
        self.pool.defragment();
    }
}

impl<S> std::fmt::Debug for ParallelOptimizer<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelOptimizer")
            .field("max_concurrency", &self.max_concurrency.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Generous wait bound for plan execution: every attempt's timeout plus
/// scheduling slack.
fn wait_bound(task: &Task) -> Duration {
    task.timeout
        .saturating_mul(task.max_retries + 1)
        .saturating_add(Duration::from_secs(60))
}

fn reject_to_error(reason: &RejectReason) -> SchedulerError {
    match reason {
        RejectReason::InvalidTask(msg) => SchedulerError::InvalidTask(msg.clone()),
        RejectReason::QueueFull(name) => SchedulerError::QueueFull(name.clone()),
        RejectReason::WouldMissDeadline => SchedulerError::DeadlineUnreachable,
        RejectReason::Unsatisfiable => SchedulerError::CapacityExceeded,
        RejectReason::DependencyFailed(dep) => {
            SchedulerError::InvalidTask(format!("dependency {dep} failed"))
        }
        RejectReason::Shutdown => SchedulerError::Shutdown,
    }
}
