//! # Forge Conductor
//!
//! The concurrency and resource-management core of the Forge automation
//! platform: an in-process scheduler that accepts units of work, decides when
//! and with what resources each may run, executes them against a bounded pool
//! of workers, and adapts capacity to load.
//!
//! ## Architecture
//!
//! Three components, leaves first:
//!
//! - [`pool::ResourcePool`] owns the authoritative capacity ledger for typed
//!   resources (CPU cores, memory blocks, IO channels, network bandwidth).
//!   Placement is policy-driven (first/best/worst-fit, smart), overflow is
//!   policy-driven (queue, reject, redirect, degrade), and the pool handles
//!   preemption, fairness ordering of waiters, defragmentation, elastic
//!   scaling, and health checks.
//! - [`sched::TaskScheduler`] owns admission: per-tier queues with selectable
//!   algorithms (FCFS, SJF, priority, round-robin, multilevel, fair-share,
//!   EDF, resource-aware), aging against starvation, deadline policy, and
//!   preemption evaluation, all driven by a cooperative non-overlapping tick.
//! - [`optimizer::ParallelOptimizer`] accepts tasks, builds dependency-aware
//!   parallelization plans, executes admitted work on dedicated worker
//!   threads via per-type processors, and runs the adaptive loop that grows
//!   and shrinks concurrency with load.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use forge_conductor::config::ConductorConfig;
//! use forge_conductor::core::{ProcessorRegistry, Task, TaskType};
//! use forge_conductor::optimizer::ParallelOptimizer;
//! use forge_conductor::runtime::TokioSpawner;
//!
//! let mut registry = ProcessorRegistry::new();
//! registry.register(TaskType::Analysis, Arc::new(MyAnalysisProcessor));
//!
//! let optimizer = ParallelOptimizer::new(
//!     ConductorConfig::default(),
//!     registry,
//!     TokioSpawner::current(),
//! )?;
//!
//! let task = Task::builder("analyze-module", TaskType::Analysis).build()?;
//! let id = optimizer.submit_task(task)?;
//! let result = optimizer.wait_for_task(id, Duration::from_secs(30)).await?;
//! ```

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Shared task model, processor abstraction, errors, and metric snapshots.
pub mod core;
/// Configuration models for the pool, scheduler, and optimizer.
pub mod config;
/// Resource pool: the typed capacity ledger.
pub mod pool;
/// Task scheduler: queues, admission, aging, deadlines, preemption.
pub mod sched;
/// Parallel optimizer: planning, worker pool, adaptive scaling.
pub mod optimizer;
/// Runtime adapters (spawn abstraction).
pub mod runtime;
/// Shared utilities.
pub mod util;
