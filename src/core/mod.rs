//! Core task model, processor abstraction, errors, and metric snapshots.

pub mod error;
pub mod metrics;
pub mod processor;
pub mod task;

pub use error::{AppResult, ProcessError, SchedulerError};
pub use metrics::{
    jain_fairness_index, OptimizationMetrics, PoolMetrics, SchedulingMetrics, TypeCapacity,
};
pub use processor::{ProcessorRegistry, TaskProcessor};
pub use task::{
    ResourceRequirements, ResourceUsage, Task, TaskBuilder, TaskId, TaskOutcome, TaskPriority,
    TaskResult, TaskState, TaskType,
};
