//! Error types for scheduler, pool, and optimizer operations.

use thiserror::Error;

/// Errors produced by the conductor components.
///
/// Cross-component calls return typed outcome enums (decisions, allocation
/// outcomes, task results); these errors cover the caller-facing API surface
/// where a typed outcome is not applicable.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Task failed submission-time validation.
    #[error("invalid task: {0}")]
    InvalidTask(String),
    /// Queue is full for the target tier.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// Task would exceed configured capacity even after degrade.
    #[error("capacity exceeded")]
    CapacityExceeded,
    /// Deadline already unreachable given current queue depth.
    #[error("deadline unreachable")]
    DeadlineUnreachable,
    /// Resource pool halted after a ledger invariant violation.
    #[error("resource pool halted: {0}")]
    PoolHalted(String),
    /// Referenced resource does not exist in the pool.
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    /// Referenced task is not known to the conductor.
    #[error("unknown task: {0}")]
    UnknownTask(u64),
    /// Waiting for a task result exceeded the caller's timeout.
    #[error("timed out waiting for task {0}")]
    ResultTimeout(u64),
    /// The component has been shut down.
    #[error("shut down")]
    Shutdown,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Error raised by a task processor while running a payload.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessError {
    /// Human-readable failure detail, captured into `TaskResult::error`.
    pub message: String,
    /// Whether the failure is worth retrying within the task's retry budget.
    pub retryable: bool,
}

impl ProcessError {
    /// A retryable processor failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A terminal processor failure; retries are skipped.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SchedulerError::QueueFull("tier normal".into()).to_string(),
            "queue full: tier normal"
        );
        assert_eq!(
            SchedulerError::ResultTimeout(7).to_string(),
            "timed out waiting for task 7"
        );
        assert_eq!(SchedulerError::CapacityExceeded.to_string(), "capacity exceeded");
    }

    #[test]
    fn test_process_error_flags() {
        assert!(ProcessError::retryable("transient").retryable);
        assert!(!ProcessError::fatal("bad payload").retryable);
    }
}
