//! End-to-end tests for the parallel optimizer: submission, dependency
//! gating, retries, timeouts, cancellation, plan execution, and adaptive
//! concurrency scaling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use forge_conductor::config::{
    ConductorConfig, OptimizerConfig, OverflowPolicy, PoolConfig, ResourceSpec,
};
use forge_conductor::core::{
    ProcessError, ProcessorRegistry, ResourceRequirements, Task, TaskOutcome, TaskProcessor,
    TaskType,
};
use forge_conductor::optimizer::ParallelOptimizer;
use forge_conductor::pool::ResourceType;
use forge_conductor::runtime::TokioSpawner;

// ============================================================================
// TEST PROCESSORS
// ============================================================================

/// Sleeps per payload, optionally failing on request, and records completion
/// order.
struct SleepProcessor {
    order: Arc<Mutex<Vec<u64>>>,
}

impl SleepProcessor {
    fn new() -> Self {
        Self { order: Arc::new(Mutex::new(Vec::new())) }
    }
}

#[async_trait]
impl TaskProcessor for SleepProcessor {
    async fn process(&self, task: &Task) -> Result<serde_json::Value, ProcessError> {
        let sleep_ms = task
            .payload
            .get("sleep_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        if task
            .payload
            .get("fail")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            return Err(ProcessError::retryable("requested failure"));
        }
        self.order.lock().push(task.id);
        Ok(json!({ "echo": task.name }))
    }
}

/// Fails the first N attempts, then succeeds.
struct FlakyProcessor {
    failures_remaining: Arc<AtomicU32>,
}

#[async_trait]
impl TaskProcessor for FlakyProcessor {
    async fn process(&self, task: &Task) -> Result<serde_json::Value, ProcessError> {
        if self.failures_remaining.load(Ordering::Acquire) > 0 {
            self.failures_remaining.fetch_sub(1, Ordering::AcqRel);
            return Err(ProcessError::retryable("flaky attempt"));
        }
        Ok(json!({ "recovered": task.id }))
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn config(cpu_units: usize, workers: usize) -> ConductorConfig {
    let mut cfg = ConductorConfig::default();
    cfg.pool = PoolConfig::new()
        .with_resources(vec![ResourceSpec::fixed(ResourceType::CpuCore, cpu_units, 1.0)])
        .with_overflow(OverflowPolicy::Reject);
    cfg.optimizer = OptimizerConfig::new()
        .with_worker_bounds(1, workers)
        .with_initial_concurrency(workers);
    cfg.optimizer.tick_interval_ms = 10;
    cfg.optimizer.retry_backoff_ms = 5;
    cfg.optimizer.scaling.enabled = false;
    cfg
}

fn registry(processor: Arc<dyn TaskProcessor>) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register(TaskType::Computation, processor);
    registry
}

fn sleepy_task(name: &str, sleep_ms: u64) -> Task {
    Task::builder(name, TaskType::Computation)
        .with_requirements(ResourceRequirements::cpu(1.0))
        .with_payload(json!({ "sleep_ms": sleep_ms }))
        .with_estimated_duration(Duration::from_millis(sleep_ms))
        .build()
        .unwrap()
}

// ============================================================================
// BASIC SUBMISSION
// ============================================================================

#[tokio::test]
async fn test_submit_and_wait() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let id = optimizer.submit_task(sleepy_task("hello", 10)).unwrap();
    let result = optimizer
        .wait_for_task(id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result.outcome, TaskOutcome::Completed);
    assert_eq!(result.value, Some(json!({ "echo": "hello" })));
    assert_eq!(result.attempts, 1);
    assert!(result.worker_id.is_some());

    let m = optimizer.metrics();
    assert_eq!(m.submitted, 1);
    assert_eq!(m.completed, 1);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_unregistered_task_type_rejected() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let task = Task::builder("no-processor", TaskType::Analysis).build().unwrap();
    assert!(optimizer.submit_task(task).is_err());
    optimizer.shutdown();
}

// ============================================================================
// CAPACITY-BOUND ADMISSION
// ============================================================================

#[tokio::test]
async fn test_three_independent_tasks_two_cpu_slots() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let ids: Vec<u64> = (0..3)
        .map(|i| {
            optimizer
                .submit_task(sleepy_task(&format!("t{i}"), 200))
                .unwrap()
        })
        .collect();

    // Two run immediately, the third queues.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(optimizer.scheduler().queued_len(), 1);
    assert_eq!(optimizer.metrics().running, 2);

    // Upon completion the queued task is admitted; everything finishes.
    for id in ids {
        let result = optimizer
            .wait_for_task(id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.outcome, TaskOutcome::Completed);
    }
    assert_eq!(optimizer.scheduler().queued_len(), 0);
    assert_eq!(optimizer.metrics().completed, 3);
    optimizer.shutdown();
}

// ============================================================================
// DEPENDENCY GATING
// ============================================================================

#[tokio::test]
async fn test_dependent_task_runs_after_dependency() {
    let processor = Arc::new(SleepProcessor::new());
    let order = Arc::clone(&processor.order);
    let optimizer = ParallelOptimizer::new(
        config(4, 4),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let id_a = optimizer.submit_task(sleepy_task("a", 100)).unwrap();
    let mut b = sleepy_task("b", 10);
    b.depends_on = vec![id_a];
    let id_b = optimizer.submit_task(b).unwrap();

    let ra = optimizer.wait_for_task(id_a, Duration::from_secs(5)).await.unwrap();
    let rb = optimizer.wait_for_task(id_b, Duration::from_secs(5)).await.unwrap();
    assert_eq!(ra.outcome, TaskOutcome::Completed);
    assert_eq!(rb.outcome, TaskOutcome::Completed);

    // B never starts before A completed.
    assert_eq!(*order.lock(), vec![id_a, id_b]);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_dependent_task_fails_when_dependency_fails() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(4, 4),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let mut failing = sleepy_task("doomed", 10);
    failing.payload = json!({ "sleep_ms": 10, "fail": true });
    let id_a = optimizer.submit_task(failing).unwrap();

    let mut b = sleepy_task("orphan", 10);
    b.depends_on = vec![id_a];
    let id_b = optimizer.submit_task(b).unwrap();

    let ra = optimizer.wait_for_task(id_a, Duration::from_secs(5)).await.unwrap();
    assert_eq!(ra.outcome, TaskOutcome::Failed);

    // The dependent is failed, never silently run.
    let rb = optimizer.wait_for_task(id_b, Duration::from_secs(5)).await.unwrap();
    assert_eq!(rb.outcome, TaskOutcome::Failed);
    assert!(rb.error.unwrap().contains("dependency"));
    optimizer.shutdown();
}

// ============================================================================
// RETRIES AND TIMEOUTS
// ============================================================================

#[tokio::test]
async fn test_retryable_failure_retries_until_success() {
    let flaky = Arc::new(FlakyProcessor {
        failures_remaining: Arc::new(AtomicU32::new(1)),
    });
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(flaky),
        TokioSpawner::current(),
    )
    .unwrap();

    let task = Task::builder("flaky", TaskType::Computation)
        .with_requirements(ResourceRequirements::cpu(1.0))
        .with_max_retries(2)
        .build()
        .unwrap();
    let id = optimizer.submit_task(task).unwrap();

    let result = optimizer.wait_for_task(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Completed);
    assert_eq!(result.attempts, 2);
    assert_eq!(optimizer.metrics().retries, 1);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_exhausted_retries_fail_terminally() {
    let flaky = Arc::new(FlakyProcessor {
        failures_remaining: Arc::new(AtomicU32::new(10)),
    });
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(flaky),
        TokioSpawner::current(),
    )
    .unwrap();

    let task = Task::builder("hopeless", TaskType::Computation)
        .with_requirements(ResourceRequirements::cpu(1.0))
        .with_max_retries(1)
        .build()
        .unwrap();
    let id = optimizer.submit_task(task).unwrap();

    let result = optimizer.wait_for_task(id, Duration::from_secs(10)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Failed);
    assert_eq!(result.attempts, 2);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_task_timeout_produces_timed_out_result() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let task = Task::builder("slow", TaskType::Computation)
        .with_requirements(ResourceRequirements::cpu(1.0))
        .with_payload(json!({ "sleep_ms": 2_000 }))
        .with_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let id = optimizer.submit_task(task).unwrap();

    let result = optimizer.wait_for_task(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::TimedOut);
    assert_eq!(optimizer.metrics().timed_out, 1);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_wait_for_task_timeout() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let id = optimizer.submit_task(sleepy_task("slowish", 500)).unwrap();
    let err = optimizer
        .wait_for_task(id, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out waiting"));

    // The task itself still completes.
    let result = optimizer.wait_for_task(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Completed);
    optimizer.shutdown();
}

// ============================================================================
// CANCELLATION
// ============================================================================

#[tokio::test]
async fn test_cancel_running_task() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let id = optimizer.submit_task(sleepy_task("long", 5_000)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(optimizer.cancel_task(id));

    let result = optimizer.wait_for_task(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Cancelled);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_cancel_queued_task_immediate() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(1, 1),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let running = optimizer.submit_task(sleepy_task("busy", 400)).unwrap();
    let queued = optimizer.submit_task(sleepy_task("parked", 10)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(optimizer.cancel_task(queued));
    let result = optimizer.wait_for_task(queued, Duration::from_secs(1)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Cancelled);
    assert_eq!(result.attempts, 0);

    let result = optimizer.wait_for_task(running, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Completed);
    optimizer.shutdown();
}

// ============================================================================
// PLANNING AND PLAN EXECUTION
// ============================================================================

#[tokio::test]
async fn test_generate_and_execute_diamond_plan() {
    let processor = Arc::new(SleepProcessor::new());
    let order = Arc::clone(&processor.order);
    let optimizer = ParallelOptimizer::new(
        config(4, 4),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    // Diamond: root -> {left, right} -> join.
    let root_id = optimizer.allocate_task_id();
    let left_id = optimizer.allocate_task_id();
    let right_id = optimizer.allocate_task_id();
    let join_id = optimizer.allocate_task_id();

    let mut root = sleepy_task("root", 30);
    root.id = root_id;
    let mut left = sleepy_task("left", 30);
    left.id = left_id;
    left.depends_on = vec![root_id];
    let mut right = sleepy_task("right", 30);
    right.id = right_id;
    right.depends_on = vec![root_id];
    let mut join = sleepy_task("join", 30);
    join.id = join_id;
    join.depends_on = vec![left_id, right_id];
    let tasks = vec![root, left, right, join];

    let plan = optimizer.generate_plan(&tasks).unwrap();
    assert_eq!(plan.groups.len(), 3);
    assert_eq!(plan.groups[1].task_ids.len(), 2);
    assert!(plan.speedup > 1.0);
    assert!(plan.efficiency > 0.0);

    let results = optimizer
        .execute_plan(&plan, &tasks)
        .await
        .unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.outcome == TaskOutcome::Completed));

    // Root first, join last; the middle pair in either order.
    let order = order.lock();
    assert_eq!(order[0], root_id);
    assert_eq!(order[3], join_id);
    optimizer.shutdown();
}

#[tokio::test]
async fn test_plan_rejects_cycles() {
    let processor = Arc::new(SleepProcessor::new());
    let optimizer = ParallelOptimizer::new(
        config(2, 2),
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    let a_id = optimizer.allocate_task_id();
    let b_id = optimizer.allocate_task_id();
    let mut a = sleepy_task("a", 10);
    a.id = a_id;
    a.depends_on = vec![b_id];
    let mut b = sleepy_task("b", 10);
    b.id = b_id;
    b.depends_on = vec![a_id];

    assert!(optimizer.generate_plan(&[a, b]).is_err());
    optimizer.shutdown();
}

// ============================================================================
// ADAPTIVE SCALING
// ============================================================================

#[tokio::test]
async fn test_adaptive_scale_up_once_per_cooldown() {
    let processor = Arc::new(SleepProcessor::new());
    let mut cfg = config(1, 4);
    cfg.optimizer = OptimizerConfig::new()
        .with_worker_bounds(1, 4)
        .with_initial_concurrency(1);
    cfg.optimizer.tick_interval_ms = 10;
    cfg.optimizer.scaling.enabled = true;
    cfg.optimizer.scaling.sample_interval_ms = 20;
    cfg.optimizer.scaling.sustained_samples = 2;
    cfg.optimizer.scaling.up_threshold = 0.5;
    cfg.optimizer.scaling.down_threshold = 0.1;
    cfg.optimizer.scaling.cooldown_ms = 60_000;
    let optimizer = ParallelOptimizer::new(
        cfg,
        registry(processor),
        TokioSpawner::current(),
    )
    .unwrap();

    // Saturate the single CPU unit long enough for several samples.
    let id = optimizer.submit_task(sleepy_task("hog", 500)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Sustained load above threshold: exactly one scale-up in the cooldown
    // window, not a burst.
    let m = optimizer.metrics();
    assert_eq!(m.scale_ups, 1);
    assert_eq!(m.max_concurrency, 2);

    let result = optimizer.wait_for_task(id, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result.outcome, TaskOutcome::Completed);
    optimizer.shutdown();
}
