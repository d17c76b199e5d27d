//! Optimizer configuration: worker bounds and the adaptive scaling loop.

use serde::{Deserialize, Serialize};

/// Thresholds and cadence for the adaptive concurrency loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveScalingConfig {
    /// Whether the loop runs at all.
    pub enabled: bool,
    /// Milliseconds between load samples.
    pub sample_interval_ms: u64,
    /// Utilization above which concurrency grows.
    pub up_threshold: f64,
    /// Utilization below which concurrency shrinks.
    pub down_threshold: f64,
    /// Consecutive samples beyond a threshold before acting.
    pub sustained_samples: u32,
    /// Minimum milliseconds between adjustments.
    pub cooldown_ms: u64,
}

impl Default for AdaptiveScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 1_000,
            up_threshold: 0.8,
            down_threshold: 0.3,
            sustained_samples: 3,
            cooldown_ms: 30_000,
        }
    }
}

/// Optimizer and worker-pool configuration. Immutable per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Lower bound on adaptive concurrency.
    pub min_workers: usize,
    /// Worker thread count and upper bound on adaptive concurrency.
    pub max_workers: usize,
    /// Starting concurrency bound; clamped to `[min_workers, max_workers]`.
    pub initial_concurrency: usize,
    /// Bound on the worker dispatch queue.
    pub max_queue_depth: usize,
    /// Stack size per worker thread, bytes.
    pub thread_stack_size: usize,
    /// Fallback per-attempt timeout when a task supplies none, milliseconds.
    pub default_task_timeout_ms: u64,
    /// Delay before resubmitting a retryable failure, milliseconds.
    pub retry_backoff_ms: u64,
    /// Milliseconds between scheduler ticks.
    pub tick_interval_ms: u64,
    /// Adaptive scaling loop parameters.
    pub scaling: AdaptiveScalingConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(1);
        Self {
            min_workers: 1,
            max_workers: cores,
            initial_concurrency: cores,
            max_queue_depth: 1024,
            thread_stack_size: 2 * 1024 * 1024,
            default_task_timeout_ms: 60_000,
            retry_backoff_ms: 50,
            tick_interval_ms: 50,
            scaling: AdaptiveScalingConfig::default(),
        }
    }
}

impl OptimizerConfig {
    /// Default configuration sized from the host CPU count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker bounds.
    #[must_use]
    pub const fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Set the starting concurrency bound.
    #[must_use]
    pub const fn with_initial_concurrency(mut self, concurrency: usize) -> Self {
        self.initial_concurrency = concurrency;
        self
    }

    /// Set the dispatch queue bound.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the adaptive scaling parameters.
    #[must_use]
    pub const fn with_scaling(mut self, scaling: AdaptiveScalingConfig) -> Self {
        self.scaling = scaling;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_workers == 0 {
            return Err("min_workers must be greater than 0".into());
        }
        if self.max_workers < self.min_workers {
            return Err("max_workers must be >= min_workers".into());
        }
        if self.initial_concurrency < self.min_workers
            || self.initial_concurrency > self.max_workers
        {
            return Err("initial_concurrency must lie within worker bounds".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 128 * 1024 {
            return Err("thread_stack_size must be at least 128 KiB".into());
        }
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        if self.scaling.enabled {
            if self.scaling.sample_interval_ms == 0 {
                return Err("sample_interval_ms must be greater than 0".into());
            }
            if self.scaling.sustained_samples == 0 {
                return Err("sustained_samples must be greater than 0".into());
            }
            if self.scaling.down_threshold >= self.scaling.up_threshold {
                return Err("scaling down_threshold must be below up_threshold".into());
            }
        }
        Ok(())
    }
}
