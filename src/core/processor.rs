//! Task processor trait and the per-type registry.
//!
//! The conductor never interprets task payloads; callers register a processor
//! per [`TaskType`] and the worker pool invokes it for each admitted task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{ProcessError, Task, TaskType};

/// Runs a task payload and produces its result value.
///
/// Called from a dedicated worker thread's runtime; implementations may block
/// on CPU work or await IO freely. The worker enforces the task's timeout
/// around this call.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Execute the task and return its result value.
    async fn process(&self, task: &Task) -> Result<serde_json::Value, ProcessError>;
}

/// Registry mapping task types to processors, with an optional fallback.
///
/// Registration is explicit; dispatch over the closed [`TaskType`] enum avoids
/// stringly-typed branching while keeping extensibility.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<TaskType, Arc<dyn TaskProcessor>>,
    fallback: Option<Arc<dyn TaskProcessor>>,
}

impl ProcessorRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for a task type, replacing any previous one.
    pub fn register(&mut self, kind: TaskType, processor: Arc<dyn TaskProcessor>) {
        self.processors.insert(kind, processor);
    }

    /// Register the fallback used when no per-type processor matches.
    pub fn register_fallback(&mut self, processor: Arc<dyn TaskProcessor>) {
        self.fallback = Some(processor);
    }

    /// Resolve the processor for a task type.
    #[must_use]
    pub fn resolve(&self, kind: TaskType) -> Option<Arc<dyn TaskProcessor>> {
        self.processors.get(&kind).cloned().or_else(|| self.fallback.clone())
    }

    /// True when a task of this type can be executed.
    #[must_use]
    pub fn supports(&self, kind: TaskType) -> bool {
        self.processors.contains_key(&kind) || self.fallback.is_some()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("types", &self.processors.keys().collect::<Vec<_>>())
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}
