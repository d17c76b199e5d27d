//! Bounded worker pool executing admitted tasks on dedicated OS threads.
//!
//! Each worker owns a single-threaded tokio runtime so processor work never
//! blocks the caller's async runtime. Workers block on a crossbeam channel
//! for dispatch and gate execution on an adjustable concurrency bound; the
//! adaptive loop raises or lowers the bound at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OptimizerConfig;
use crate::core::{ProcessorRegistry, SchedulerError, Task, TaskId};

/// A task admitted by the scheduler, carrying its live allocation.
#[derive(Debug)]
pub struct ExecutableTask {
    /// The immutable submission record.
    pub task: Task,
    /// Allocation to release on completion.
    pub allocation_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What one execution attempt produced.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Processor returned a value.
    Completed {
        /// The processor's result value.
        value: serde_json::Value,
    },
    /// Processor raised an error.
    Failed {
        /// Error detail.
        error: String,
        /// Whether the retry budget may be spent on it.
        retryable: bool,
    },
    /// The attempt exceeded the task timeout.
    TimedOut,
    /// Interrupted by a cancellation signal.
    Cancelled,
    /// Interrupted by a preemption signal; no result is recorded.
    Preempted,
}

/// Completion event emitted by a worker; the optimizer's drain loop releases
/// resources, updates scheduler state, and resolves or retries.
#[derive(Debug)]
pub struct CompletionEvent {
    /// The task that ran.
    pub task: Task,
    /// Allocation backing the attempt.
    pub allocation_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempt outcome.
    pub outcome: AttemptOutcome,
    /// Wall time of the attempt.
    pub execution_time: Duration,
    /// Worker thread that ran it.
    pub worker_id: usize,
}

/// Interrupt kinds deliverable to a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Advisory cancellation.
    Cancel,
    /// Preemption; the task will be requeued.
    Preempt,
}

const INTERRUPT_NONE: u8 = 0;
const INTERRUPT_CANCEL: u8 = 1;
const INTERRUPT_PREEMPT: u8 = 2;

/// Per-task interrupt flag: a kind plus an async wakeup.
struct TaskInterrupt {
    kind: AtomicU8,
    notify: tokio::sync::Notify,
}

impl TaskInterrupt {
    fn new() -> Self {
        Self { kind: AtomicU8::new(INTERRUPT_NONE), notify: tokio::sync::Notify::new() }
    }

    fn fire(&self, kind: InterruptKind) {
        let value = match kind {
            InterruptKind::Cancel => INTERRUPT_CANCEL,
            InterruptKind::Preempt => INTERRUPT_PREEMPT,
        };
        self.kind.store(value, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    fn current(&self) -> Option<InterruptKind> {
        match self.kind.load(Ordering::Acquire) {
            INTERRUPT_CANCEL => Some(InterruptKind::Cancel),
            INTERRUPT_PREEMPT => Some(InterruptKind::Preempt),
            _ => None,
        }
    }
}

/// Registry of live interrupt flags, keyed by task id.
#[derive(Default)]
struct InterruptRegistry {
    flags: Mutex<HashMap<TaskId, Arc<TaskInterrupt>>>,
}

impl InterruptRegistry {
    fn register(&self, task_id: TaskId) -> Arc<TaskInterrupt> {
        let flag = Arc::new(TaskInterrupt::new());
        self.flags.lock().insert(task_id, Arc::clone(&flag));
        flag
    }

    fn fire(&self, task_id: TaskId, kind: InterruptKind) -> bool {
        self.flags.lock().get(&task_id).map_or(false, |flag| {
            flag.fire(kind);
            true
        })
    }

    fn remove(&self, task_id: TaskId) {
        self.flags.lock().remove(&task_id);
    }
}

/// Worker pool with dedicated OS threads and an adjustable concurrency gate.
pub struct WorkerPool {
    worker_count: usize,
    task_tx: Mutex<Option<Sender<ExecutableTask>>>,
    interrupts: Arc<InterruptRegistry>,
    /// Running-task gate: count plus condvar, bounded by `max_concurrency`.
    gate: Arc<(Mutex<usize>, Condvar)>,
    max_concurrency: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Per-attempt timeout: the task's own, or the pool default when a caller
/// built a task record with a zero timeout by hand.
fn effective_timeout(task: &Task, default_timeout: Duration) -> Duration {
    if task.timeout.is_zero() {
        default_timeout
    } else {
        task.timeout
    }
}

impl WorkerPool {
    /// Spawn `config.max_workers` worker threads executing via the registry.
    /// Completion events flow into `completion_tx`.
    pub fn new(
        config: &OptimizerConfig,
        registry: ProcessorRegistry,
        completion_tx: tokio::sync::mpsc::UnboundedSender<CompletionEvent>,
        max_concurrency: Arc<AtomicUsize>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;

        let (task_tx, task_rx) = bounded::<ExecutableTask>(config.max_queue_depth);
        let interrupts = Arc::new(InterruptRegistry::default());
        let gate = Arc::new((Mutex::new(0_usize), Condvar::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let default_timeout = Duration::from_millis(config.default_task_timeout_ms);
        let mut workers = Vec::with_capacity(config.max_workers);
        for worker_id in 0..config.max_workers {
            workers.push(spawn_worker(
                worker_id,
                task_rx.clone(),
                registry.clone(),
                completion_tx.clone(),
                Arc::clone(&interrupts),
                Arc::clone(&gate),
                Arc::clone(&max_concurrency),
                Arc::clone(&active),
                Arc::clone(&shutdown),
                config.thread_stack_size,
                default_timeout,
            ));
        }

        info!(
            worker_count = config.max_workers,
            max_concurrency = max_concurrency.load(Ordering::Relaxed),
            max_queue_depth = config.max_queue_depth,
            "worker pool initialized"
        );

        Ok(Self {
            worker_count: config.max_workers,
            task_tx: Mutex::new(Some(task_tx)),
            interrupts,
            gate,
            max_concurrency,
            active,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    /// Dispatch an admitted task to the workers.
    pub fn submit(&self, exec: ExecutableTask) -> Result<(), SchedulerError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }
        self.interrupts.register(exec.task.id);
        let guard = self.task_tx.lock();
        let Some(tx) = guard.as_ref() else {
            self.interrupts.remove(exec.task.id);
            return Err(SchedulerError::Shutdown);
        };
        match tx.try_send(exec) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(exec)) => {
                self.interrupts.remove(exec.task.id);
                warn!(task = exec.task.id, "worker dispatch queue full");
                Err(SchedulerError::QueueFull("worker dispatch".into()))
            }
            Err(crossbeam_channel::TrySendError::Disconnected(exec)) => {
                self.interrupts.remove(exec.task.id);
                Err(SchedulerError::Shutdown)
            }
        }
    }

    /// Signal a running (or dispatched) task. Returns false when unknown.
    pub fn interrupt(&self, task_id: TaskId, kind: InterruptKind) -> bool {
        self.interrupts.fire(task_id, kind)
    }

    /// Adjust the concurrency bound and wake gated workers.
    pub fn set_max_concurrency(&self, value: usize) {
        self.max_concurrency.store(value, Ordering::Release);
        self.gate.1.notify_all();
    }

    /// Tasks currently executing.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Worker thread count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Shut down: close the dispatch channel and wake everything. Workers
    /// exit once their current task finishes.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down worker pool");
        *self.task_tx.lock() = None;
        self.gate.1.notify_all();

        let mut workers = self.workers.lock();
        for (idx, worker) in workers.drain(..).enumerate() {
            if worker.join().is_err() {
                warn!(worker_id = idx, "worker panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal but do not join: detached workers exit once the channel
        // drains, and joining here would hang droppers holding a runtime.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            *self.task_tx.lock() = None;
            self.gate.1.notify_all();
            debug!("worker pool dropped without explicit shutdown");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    worker_id: usize,
    task_rx: Receiver<ExecutableTask>,
    registry: ProcessorRegistry,
    completion_tx: tokio::sync::mpsc::UnboundedSender<CompletionEvent>,
    interrupts: Arc<InterruptRegistry>,
    gate: Arc<(Mutex<usize>, Condvar)>,
    max_concurrency: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    stack_size: usize,
    default_timeout: Duration,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("conductor-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id, "worker thread started");

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                    return;
                }
            };

            // Blocking recv; a dropped sender unblocks and ends the loop.
            while let Ok(exec) = task_rx.recv() {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                // Concurrency gate: wait until a slot opens under the bound.
                {
                    let (lock, condvar) = &*gate;
                    let mut running = lock.lock();
                    while *running >= max_concurrency.load(Ordering::Acquire)
                        && !shutdown.load(Ordering::Acquire)
                    {
                        condvar.wait(&mut running);
                    }
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    *running += 1;
                }
                active.fetch_add(1, Ordering::Relaxed);

                let event =
                    run_attempt(worker_id, &rt, &registry, &interrupts, exec, default_timeout);
                interrupts.remove(event.task.id);

                {
                    let (lock, condvar) = &*gate;
                    let mut running = lock.lock();
                    *running = running.saturating_sub(1);
                    condvar.notify_all();
                }
                active.fetch_sub(1, Ordering::Relaxed);

                if completion_tx.send(event).is_err() {
                    debug!(worker_id, "completion channel closed, exiting");
                    break;
                }
            }

            debug!(worker_id, "worker thread exiting");
        })
        .expect("failed to spawn worker thread")
}

/// Execute one attempt with timeout and interrupt handling.
fn run_attempt(
    worker_id: usize,
    rt: &tokio::runtime::Runtime,
    registry: &ProcessorRegistry,
    interrupts: &InterruptRegistry,
    exec: ExecutableTask,
    default_timeout: Duration,
) -> CompletionEvent {
    let ExecutableTask { task, allocation_id, attempt } = exec;
    let started = Instant::now();

    let flag = interrupts
        .flags
        .lock()
        .get(&task.id)
        .cloned()
        .unwrap_or_else(|| Arc::new(TaskInterrupt::new()));

    // Interrupted while still queued for dispatch: report without running.
    if let Some(kind) = flag.current() {
        let outcome = match kind {
            InterruptKind::Cancel => AttemptOutcome::Cancelled,
            InterruptKind::Preempt => AttemptOutcome::Preempted,
        };
        return CompletionEvent {
            task,
            allocation_id,
            attempt,
            outcome,
            execution_time: Duration::ZERO,
            worker_id,
        };
    }

    let Some(processor) = registry.resolve(task.kind) else {
        return CompletionEvent {
            outcome: AttemptOutcome::Failed {
                error: format!("no processor registered for {:?}", task.kind),
                retryable: false,
            },
            execution_time: Duration::ZERO,
            task,
            allocation_id,
            attempt,
            worker_id,
        };
    };

    debug!(worker_id, task = task.id, attempt, "executing task");
    let timeout = effective_timeout(&task, default_timeout);
    let outcome = rt.block_on(async {
        tokio::select! {
            attempt_result = tokio::time::timeout(timeout, processor.process(&task)) => {
                match attempt_result {
                    Ok(Ok(value)) => AttemptOutcome::Completed { value },
                    Ok(Err(e)) => AttemptOutcome::Failed {
                        error: e.message,
                        retryable: e.retryable,
                    },
                    Err(_) => AttemptOutcome::TimedOut,
                }
            }
            () = flag.notify.notified() => {
                match flag.current() {
                    Some(InterruptKind::Preempt) => AttemptOutcome::Preempted,
                    _ => AttemptOutcome::Cancelled,
                }
            }
        }
    });

    CompletionEvent {
        task,
        allocation_id,
        attempt,
        outcome,
        execution_time: started.elapsed(),
        worker_id,
    }
}
