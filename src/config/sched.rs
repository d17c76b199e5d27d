//! Scheduler configuration: queues, algorithms, aging, and deadline policy.

use serde::{Deserialize, Serialize};

use crate::core::TaskPriority;

/// Admission ordering algorithm, selectable per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingAlgorithm {
    /// First come, first served by arrival timestamp.
    #[default]
    Fcfs,
    /// Shortest estimated duration first.
    ShortestJobFirst,
    /// Strict (boosted) priority, FIFO within a rank.
    PriorityFirst,
    /// Rotating cursor with a time slice; exhausted slices move to the back.
    RoundRobin,
    /// Boosted rank tiers drained top-down, FIFO within each tier.
    MultilevelQueue,
    /// Virtual-time fair scheduling; lowest accumulated vruntime first.
    FairShare,
    /// Earliest deadline first; deadline-less tasks sort last.
    EarliestDeadlineFirst,
    /// Weights admission by scarcity of each requested resource axis.
    ResourceAware,
}

/// Handling of tasks projected to miss their deadline, applied during ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeadlinePolicy {
    /// Remove the task with a timed-out result.
    #[default]
    Drop,
    /// Keep scheduling regardless; the miss is only counted.
    Continue,
    /// Demote to the lowest effective rank and keep it queued.
    Deprioritize,
}

/// Aging parameters preventing starvation of long-waiting tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgingConfig {
    /// Wait duration after which a boost step is applied, milliseconds.
    pub threshold_ms: u64,
    /// Rank increase per step.
    pub boost_step: u8,
    /// Maximum total boost.
    pub max_boost: u8,
}

impl Default for AgingConfig {
    fn default() -> Self {
        Self { threshold_ms: 5_000, boost_step: 1, max_boost: 4 }
    }
}

/// One scheduler queue definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSpec {
    /// Queue name, also the metrics key.
    pub name: String,
    /// Priority tier this queue admits.
    pub tier: TaskPriority,
    /// Ordering algorithm within the queue.
    pub algorithm: SchedulingAlgorithm,
    /// Maximum queued tasks before rejection.
    pub max_size: usize,
    /// Round-robin time slice, milliseconds.
    pub time_slice_ms: u64,
}

/// Scheduler configuration. Immutable once the scheduler is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Queue definitions; one queue per priority tier by default.
    pub queues: Vec<QueueSpec>,
    /// Aging/boost parameters.
    pub aging: AgingConfig,
    /// Deadline handling during ticks.
    pub deadline_policy: DeadlinePolicy,
    /// Whether the scheduler evaluates preemption under pressure.
    pub preemption_enabled: bool,
    /// Safety multiplier on the queue-depth service projection used by the
    /// would-miss-deadline admission check.
    pub projection_safety_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::with_algorithm(SchedulingAlgorithm::Fcfs)
    }
}

impl SchedulerConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One queue per priority tier, all using the given algorithm.
    #[must_use]
    pub fn with_algorithm(algorithm: SchedulingAlgorithm) -> Self {
        let tiers = [
            ("urgent", TaskPriority::Urgent),
            ("high", TaskPriority::High),
            ("normal", TaskPriority::Normal),
            ("low", TaskPriority::Low),
            ("background", TaskPriority::Background),
        ];
        Self {
            queues: tiers
                .into_iter()
                .map(|(name, tier)| QueueSpec {
                    name: name.to_string(),
                    tier,
                    algorithm,
                    max_size: 1024,
                    time_slice_ms: 100,
                })
                .collect(),
            aging: AgingConfig::default(),
            deadline_policy: DeadlinePolicy::Drop,
            preemption_enabled: false,
            projection_safety_factor: 1.2,
        }
    }

    /// Set the aging parameters.
    #[must_use]
    pub const fn with_aging(mut self, aging: AgingConfig) -> Self {
        self.aging = aging;
        self
    }

    /// Set the deadline policy.
    #[must_use]
    pub const fn with_deadline_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.deadline_policy = policy;
        self
    }

    /// Enable preemption evaluation during ticks.
    #[must_use]
    pub const fn with_preemption(mut self, enabled: bool) -> Self {
        self.preemption_enabled = enabled;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.queues.is_empty() {
            return Err("at least one queue must be defined".into());
        }
        for q in &self.queues {
            if q.name.trim().is_empty() {
                return Err("queue name must not be empty".into());
            }
            if q.max_size == 0 {
                return Err(format!("queue `{}`: max_size must be greater than 0", q.name));
            }
            if q.algorithm == SchedulingAlgorithm::RoundRobin && q.time_slice_ms == 0 {
                return Err(format!("queue `{}`: round robin needs a time slice", q.name));
            }
        }
        if self.projection_safety_factor < 1.0 {
            return Err("projection_safety_factor must be >= 1.0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_all_tiers() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.queues.len(), 5);
        assert!(cfg.queues.iter().any(|q| q.tier == TaskPriority::Urgent));
        assert!(cfg.queues.iter().any(|q| q.tier == TaskPriority::Background));
    }

    #[test]
    fn test_invalid_queue_rejected() {
        let mut cfg = SchedulerConfig::default();
        cfg.queues[0].max_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SchedulerConfig::with_algorithm(SchedulingAlgorithm::RoundRobin);
        cfg.queues[0].time_slice_ms = 0;
        assert!(cfg.validate().is_err());
    }
}
