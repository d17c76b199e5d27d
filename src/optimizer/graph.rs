//! Dependency graph construction, cycle detection, and wave layering.

use std::collections::{HashMap, HashSet};

use crate::core::{SchedulerError, Task, TaskId};

/// Dependency graph over one batch of tasks.
///
/// Dependencies pointing outside the batch are assumed already satisfied;
/// only intra-batch edges shape the layering.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<TaskId>,
    /// task -> intra-batch dependencies.
    deps: HashMap<TaskId, Vec<TaskId>>,
    /// dependency -> dependents.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    /// Estimated duration per node, milliseconds.
    duration_ms: HashMap<TaskId, f64>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate ids and cycles.
    pub fn build(tasks: &[Task]) -> Result<Self, SchedulerError> {
        let ids: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        if ids.len() != tasks.len() {
            return Err(SchedulerError::InvalidTask("duplicate task ids in batch".into()));
        }

        let mut deps: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut duration_ms = HashMap::new();
        for task in tasks {
            let intra: Vec<TaskId> = task
                .depends_on
                .iter()
                .copied()
                .filter(|d| ids.contains(d))
                .collect();
            for &dep in &intra {
                dependents.entry(dep).or_default().push(task.id);
            }
            deps.insert(task.id, intra);
            duration_ms.insert(task.id, task.estimated_duration.as_millis() as f64);
        }

        let graph = Self {
            nodes: tasks.iter().map(|t| t.id).collect(),
            deps,
            dependents,
            duration_ms,
        };
        if graph.layers_internal().is_none() {
            return Err(SchedulerError::InvalidTask("dependency cycle detected".into()));
        }
        Ok(graph)
    }

    /// Number of tasks in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the batch was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Intra-batch dependencies of a task.
    #[must_use]
    pub fn deps_of(&self, id: TaskId) -> &[TaskId] {
        self.deps.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Topological waves: each layer contains tasks whose dependencies all
    /// sit in earlier layers, so one layer may run concurrently.
    #[must_use]
    pub fn layers(&self) -> Vec<Vec<TaskId>> {
        // Cycles were rejected in `build`.
        self.layers_internal().unwrap_or_default()
    }

    fn layers_internal(&self) -> Option<Vec<Vec<TaskId>>> {
        let mut indegree: HashMap<TaskId, usize> = self
            .nodes
            .iter()
            .map(|&id| (id, self.deps_of(id).len()))
            .collect();
        let mut layers = Vec::new();
        let mut remaining = self.nodes.len();

        let mut frontier: Vec<TaskId> = self
            .nodes
            .iter()
            .copied()
            .filter(|id| indegree[id] == 0)
            .collect();
        while !frontier.is_empty() {
            frontier.sort_unstable();
            remaining -= frontier.len();
            let mut next = Vec::new();
            for &id in &frontier {
                for &dependent in self.dependents.get(&id).map_or(&[][..], Vec::as_slice) {
                    let d = indegree.get_mut(&dependent)?;
                    *d -= 1;
                    if *d == 0 {
                        next.push(dependent);
                    }
                }
            }
            layers.push(std::mem::take(&mut frontier));
            frontier = next;
        }

        if remaining == 0 {
            Some(layers)
        } else {
            None
        }
    }

    /// Length of the longest dependency chain by estimated duration,
    /// milliseconds. The lower bound on any parallel schedule.
    #[must_use]
    pub fn critical_path_ms(&self) -> f64 {
        let mut finish: HashMap<TaskId, f64> = HashMap::new();
        for layer in self.layers() {
            for id in layer {
                let dep_finish = self
                    .deps_of(id)
                    .iter()
                    .map(|d| finish.get(d).copied().unwrap_or(0.0))
                    .fold(0.0, f64::max);
                finish.insert(id, dep_finish + self.duration_ms.get(&id).copied().unwrap_or(0.0));
            }
        }
        finish.values().copied().fold(0.0, f64::max)
    }
}
