//! Task model: submission records, resource requirements, lifecycle states,
//! and terminal results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

/// Unique task identifier, assigned by the optimizer at submission.
pub type TaskId = u64;

/// Workload category of a task. Closed set; per-type processors are attached
/// through the [`crate::core::ProcessorRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// CPU-bound computation (compilation, numeric analysis).
    CpuIntensive,
    /// Blocking or streaming IO.
    IoBound,
    /// Large working-set workloads.
    MemoryIntensive,
    /// Outbound network calls.
    NetworkRequest,
    /// General computation without a dominant resource.
    Computation,
    /// Pipeline analysis stages.
    Analysis,
    /// Test suite execution.
    TestExecution,
    /// Generation stages producing artifacts.
    CodeGeneration,
}

/// Scheduling priority. Ordering is by urgency: `Urgent` outranks everything,
/// `Background` yields to everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Highest urgency; may trigger preemption of lower tiers.
    Urgent,
    /// Above normal.
    High,
    /// Default tier.
    #[default]
    Normal,
    /// Below normal.
    Low,
    /// Runs only when nothing else is waiting.
    Background,
}

impl TaskPriority {
    /// Numeric rank, higher is more urgent.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Urgent => 4,
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
            Self::Background => 0,
        }
    }

    /// Rank boosted by aging, saturating at the `Urgent` rank.
    #[must_use]
    pub const fn boosted(self, boost: u8) -> u8 {
        let r = self.rank().saturating_add(boost);
        if r > 4 { 4 } else { r }
    }
}

/// Requested resource magnitudes in normalized units (non-negative).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    /// CPU units.
    pub cpu: f64,
    /// Memory units.
    pub memory: f64,
    /// IO channel units.
    pub io: f64,
    /// Network bandwidth units.
    pub network: f64,
}

impl ResourceRequirements {
    /// Requirements with only a CPU component.
    #[must_use]
    pub const fn cpu(units: f64) -> Self {
        Self { cpu: units, memory: 0.0, io: 0.0, network: 0.0 }
    }

    /// Sum of all axes; used for pressure and fairness weighting.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.cpu + self.memory + self.io + self.network
    }

    /// True when every axis is finite and non-negative.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.memory, self.io, self.network]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }

    /// Uniformly scaled copy, clamped at zero.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            cpu: (self.cpu * factor).max(0.0),
            memory: (self.memory * factor).max(0.0),
            io: (self.io * factor).max(0.0),
            network: (self.network * factor).max(0.0),
        }
    }

    /// True when every axis is at least the corresponding floor axis.
    #[must_use]
    pub fn meets_minimum(&self, floor: &Self) -> bool {
        self.cpu >= floor.cpu
            && self.memory >= floor.memory
            && self.io >= floor.io
            && self.network >= floor.network
    }

    /// Component-wise sum.
    #[must_use]
    pub fn plus(&self, other: &Self) -> Self {
        Self {
            cpu: self.cpu + other.cpu,
            memory: self.memory + other.memory,
            io: self.io + other.io,
            network: self.network + other.network,
        }
    }
}

/// Observed or estimated actual consumption, billed against the pool ledger.
pub type ResourceUsage = ResourceRequirements;

/// Immutable task submission record. Never mutated after creation; owned by
/// the scheduler until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Human-readable name.
    pub name: String,
    /// Workload category, selects the processor.
    pub kind: TaskType,
    /// Scheduling priority tier.
    pub priority: TaskPriority,
    /// Tasks that must complete before this one may run (ordered, deduped).
    pub depends_on: Vec<TaskId>,
    /// Caller's duration estimate, used for SJF ordering and planning.
    pub estimated_duration: Duration,
    /// Retry budget for failed/timed-out attempts.
    pub max_retries: u32,
    /// Per-attempt execution timeout.
    pub timeout: Duration,
    /// Requested resources.
    pub requirements: ResourceRequirements,
    /// Floor for the `Degrade` overflow policy; `None` means not degradable.
    pub min_requirements: Option<ResourceRequirements>,
    /// Opaque payload, interpreted only by the processor.
    pub payload: serde_json::Value,
    /// Free-form tags; `exclusive` marks non-parallel-executable groups,
    /// other tags feed affinity-aware placement.
    pub tags: Vec<String>,
    /// Submission timestamp in milliseconds since epoch.
    pub created_at_ms: u128,
}

impl Task {
    /// Start building a task with required fields.
    pub fn builder(name: impl Into<String>, kind: TaskType) -> TaskBuilder {
        TaskBuilder::new(name, kind)
    }

    /// True when the task carries the `exclusive` tag.
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.tags.iter().any(|t| t == "exclusive")
    }
}

/// Builder for [`Task`]. Validates on [`TaskBuilder::build`].
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    kind: TaskType,
    priority: TaskPriority,
    depends_on: Vec<TaskId>,
    estimated_duration: Duration,
    max_retries: u32,
    timeout: Duration,
    requirements: ResourceRequirements,
    min_requirements: Option<ResourceRequirements>,
    payload: serde_json::Value,
    tags: Vec<String>,
}

impl TaskBuilder {
    fn new(name: impl Into<String>, kind: TaskType) -> Self {
        Self {
            name: name.into(),
            kind,
            priority: TaskPriority::Normal,
            depends_on: Vec::new(),
            estimated_duration: Duration::from_secs(1),
            max_retries: 0,
            timeout: Duration::from_secs(60),
            requirements: ResourceRequirements::cpu(1.0),
            min_requirements: None,
            payload: serde_json::Value::Null,
            tags: Vec::new(),
        }
    }

    /// Set the priority tier.
    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency on another task. Duplicates are ignored.
    #[must_use]
    pub fn with_dependency(mut self, dep: TaskId) -> Self {
        if !self.depends_on.contains(&dep) {
            self.depends_on.push(dep);
        }
        self
    }

    /// Set the duration estimate.
    #[must_use]
    pub const fn with_estimated_duration(mut self, d: Duration) -> Self {
        self.estimated_duration = d;
        self
    }

    /// Set the retry budget.
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the resource requirements.
    #[must_use]
    pub const fn with_requirements(mut self, req: ResourceRequirements) -> Self {
        self.requirements = req;
        self
    }

    /// Set the degrade floor, enabling the `Degrade` overflow policy.
    #[must_use]
    pub const fn with_min_requirements(mut self, floor: ResourceRequirements) -> Self {
        self.min_requirements = Some(floor);
        self
    }

    /// Set the opaque payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Add a free-form tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Validate and produce the task. The id is assigned at submission; the
    /// builder leaves it at zero.
    pub fn build(self) -> Result<Task, SchedulerError> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::InvalidTask("name must not be empty".into()));
        }
        if !self.requirements.is_valid() {
            return Err(SchedulerError::InvalidTask(
                "requirements must be finite and non-negative".into(),
            ));
        }
        if let Some(floor) = &self.min_requirements {
            if !floor.is_valid() || !self.requirements.meets_minimum(floor) {
                return Err(SchedulerError::InvalidTask(
                    "min_requirements must be valid and below requirements".into(),
                ));
            }
        }
        if self.timeout.is_zero() {
            return Err(SchedulerError::InvalidTask("timeout must be positive".into()));
        }
        Ok(Task {
            id: 0,
            name: self.name,
            kind: self.kind,
            priority: self.priority,
            depends_on: self.depends_on,
            estimated_duration: self.estimated_duration,
            max_retries: self.max_retries,
            timeout: self.timeout,
            requirements: self.requirements,
            min_requirements: self.min_requirements,
            payload: self.payload,
            tags: self.tags,
            created_at_ms: crate::util::clock::now_ms(),
        })
    }
}

/// Lifecycle state of a task across all three components.
///
/// `Submitted → {Rejected | Queued} → WaitingForResources ⇄ Preempted →
/// Running → {Completed | Failed | TimedOut | Cancelled}`; terminal states are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted by the optimizer, not yet examined by the scheduler.
    Submitted,
    /// Parked in a scheduler queue.
    Queued,
    /// Eligible but waiting on pool capacity.
    WaitingForResources,
    /// Evicted from resources; will re-enter exactly one queue.
    Preempted,
    /// Executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Processor raised an error and the retry budget is exhausted.
    Failed,
    /// Per-attempt timeout fired and the retry budget is exhausted.
    TimedOut,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskState {
    /// Terminal states are absorbing.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled)
    }
}

/// Terminal outcome carried by a [`TaskResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Processor returned a value.
    Completed,
    /// Processor raised an error.
    Failed,
    /// Attempt exceeded the task timeout.
    TimedOut,
    /// Cancelled before completion.
    Cancelled,
}

/// Terminal record, created exactly once per logical task lifetime. Retries
/// produce new attempts, not additional results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Task this result belongs to.
    pub task_id: TaskId,
    /// Terminal outcome.
    pub outcome: TaskOutcome,
    /// Processor return value for completed tasks.
    pub value: Option<serde_json::Value>,
    /// Error detail for failed/timed-out tasks.
    pub error: Option<String>,
    /// Wall time of the final attempt.
    pub execution_time: Duration,
    /// Observed resource usage, billed to the pool ledger.
    pub usage: ResourceUsage,
    /// Worker thread that ran the final attempt, if any ran.
    pub worker_id: Option<usize>,
    /// Number of attempts consumed (1 = no retries).
    pub attempts: u32,
}

impl TaskResult {
    /// A cancelled result with no attempt recorded.
    #[must_use]
    pub fn cancelled(task_id: TaskId) -> Self {
        Self {
            task_id,
            outcome: TaskOutcome::Cancelled,
            value: None,
            error: None,
            execution_time: Duration::ZERO,
            usage: ResourceUsage::default(),
            worker_id: None,
            attempts: 0,
        }
    }

    /// A failed result with an error message.
    #[must_use]
    pub fn failed(task_id: TaskId, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            task_id,
            outcome: TaskOutcome::Failed,
            value: None,
            error: Some(error.into()),
            execution_time: Duration::ZERO,
            usage: ResourceUsage::default(),
            worker_id: None,
            attempts,
        }
    }
}
