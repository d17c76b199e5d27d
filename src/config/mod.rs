//! Configuration models for the pool, scheduler, and optimizer.

pub mod optimizer;
pub mod pool;
pub mod sched;

pub use optimizer::{AdaptiveScalingConfig, OptimizerConfig};
pub use pool::{
    FairnessPolicy, HealthCheckConfig, OverflowPolicy, PlacementStrategy, PoolConfig,
    PoolScalingConfig, PreemptionConfig, ResourceSpec, VictimSelection,
};
pub use sched::{AgingConfig, DeadlinePolicy, QueueSpec, SchedulerConfig, SchedulingAlgorithm};

use serde::{Deserialize, Serialize};

/// Root configuration for a conductor instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Resource pool configuration.
    pub pool: PoolConfig,
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,
    /// Optimizer configuration.
    pub optimizer: OptimizerConfig,
}

impl ConductorConfig {
    /// Validate all sections.
    pub fn validate(&self) -> Result<(), String> {
        self.pool.validate().map_err(|e| format!("pool: {e}"))?;
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler: {e}"))?;
        self.optimizer
            .validate()
            .map_err(|e| format!("optimizer: {e}"))?;
        Ok(())
    }

    /// Parse a full configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
