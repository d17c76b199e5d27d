//! Scheduler queues and the per-entry scheduling metadata.

use std::time::Duration;

use crate::config::{QueueSpec, SchedulingAlgorithm};
use crate::core::{SchedulerError, Task, TaskId, TaskPriority};

/// A task parked in a scheduler queue, with the mutable scheduling metadata
/// the tick operates on. Only the scheduler writes these fields.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    /// The immutable submission record.
    pub task: Task,
    /// When the entry entered this queue, milliseconds since epoch.
    pub enqueued_at_ms: u128,
    /// Absolute deadline, milliseconds since epoch.
    pub deadline_ms: Option<u128>,
    /// Aging boost accumulated so far.
    pub boost: u8,
    /// When the last boost step was applied.
    pub last_boost_ms: u128,
    /// Virtual runtime snapshot for fair-share ordering.
    pub vruntime: f64,
    /// Execution attempts consumed before this queue entry (preemptions and
    /// retries).
    pub attempts: u32,
    /// True when re-entering after preemption.
    pub preempted: bool,
    /// True once the deadline policy demoted this entry.
    pub deprioritized: bool,
    /// Round-robin rotations this entry has been passed over.
    pub rr_rounds: u32,
    /// True once a deadline miss was counted for this entry.
    pub miss_counted: bool,
}

impl QueuedTask {
    /// New entry for a task entering the queue now.
    #[must_use]
    pub fn new(task: Task, now_ms: u128, deadline_ms: Option<u128>, vruntime: f64) -> Self {
        Self {
            task,
            enqueued_at_ms: now_ms,
            deadline_ms,
            boost: 0,
            last_boost_ms: now_ms,
            vruntime,
            attempts: 0,
            preempted: false,
            deprioritized: false,
            rr_rounds: 0,
            miss_counted: false,
        }
    }

    /// Effective priority rank after boosting and deadline demotion.
    #[must_use]
    pub fn effective_rank(&self) -> u8 {
        if self.deprioritized {
            0
        } else {
            self.task.priority.boosted(self.boost)
        }
    }

    /// Milliseconds this entry has waited in the queue.
    #[must_use]
    pub fn wait_ms(&self, now_ms: u128) -> u128 {
        now_ms.saturating_sub(self.enqueued_at_ms)
    }
}

/// One scheduler queue. A task belongs to exactly one queue at a time.
#[derive(Debug)]
pub struct TaskQueue {
    /// Queue name; also the metrics key.
    pub name: String,
    /// Priority tier this queue admits.
    pub tier: TaskPriority,
    /// Ordering algorithm within the queue.
    pub algorithm: SchedulingAlgorithm,
    /// Maximum queued tasks before rejection.
    pub max_size: usize,
    /// Round-robin time slice.
    pub time_slice: Duration,
    entries: Vec<QueuedTask>,
}

impl TaskQueue {
    /// Build a queue from its spec.
    #[must_use]
    pub fn from_spec(spec: &QueueSpec) -> Self {
        Self {
            name: spec.name.clone(),
            tier: spec.tier,
            algorithm: spec.algorithm,
            max_size: spec.max_size,
            time_slice: Duration::from_millis(spec.time_slice_ms),
            entries: Vec::new(),
        }
    }

    /// Current depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Park an entry, enforcing the depth bound.
    pub fn push(&mut self, entry: QueuedTask) -> Result<(), SchedulerError> {
        if self.entries.len() >= self.max_size {
            return Err(SchedulerError::QueueFull(self.name.clone()));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Remove a specific task; pure removal, used by cancellation.
    pub fn remove(&mut self, task_id: TaskId) -> Option<QueuedTask> {
        let idx = self.entries.iter().position(|e| e.task.id == task_id)?;
        Some(self.entries.remove(idx))
    }

    /// Take the entry at a known index.
    pub fn take(&mut self, index: usize) -> QueuedTask {
        self.entries.remove(index)
    }

    /// True when the queue holds the task.
    #[must_use]
    pub fn contains(&self, task_id: TaskId) -> bool {
        self.entries.iter().any(|e| e.task.id == task_id)
    }

    /// Immutable view of the entries.
    #[must_use]
    pub fn entries(&self) -> &[QueuedTask] {
        &self.entries
    }

    /// Mutable view for the tick's aging and deadline passes.
    pub fn entries_mut(&mut self) -> &mut Vec<QueuedTask> {
        &mut self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskType;

    fn spec() -> QueueSpec {
        QueueSpec {
            name: "normal".into(),
            tier: TaskPriority::Normal,
            algorithm: SchedulingAlgorithm::Fcfs,
            max_size: 2,
            time_slice_ms: 100,
        }
    }

    fn entry(id: TaskId) -> QueuedTask {
        let mut task = Task::builder("t", TaskType::Computation).build().unwrap();
        task.id = id;
        QueuedTask::new(task, 1_000, None, 0.0)
    }

    #[test]
    fn test_depth_bound() {
        let mut q = TaskQueue::from_spec(&spec());
        q.push(entry(1)).unwrap();
        q.push(entry(2)).unwrap();
        assert!(matches!(q.push(entry(3)), Err(SchedulerError::QueueFull(_))));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_remove_is_pure() {
        let mut q = TaskQueue::from_spec(&spec());
        q.push(entry(1)).unwrap();
        q.push(entry(2)).unwrap();
        assert!(q.remove(1).is_some());
        assert!(q.remove(1).is_none());
        assert!(q.contains(2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_effective_rank_boost_and_demotion() {
        let mut e = entry(1);
        assert_eq!(e.effective_rank(), TaskPriority::Normal.rank());
        e.boost = 2;
        assert_eq!(e.effective_rank(), TaskPriority::Urgent.rank());
        e.deprioritized = true;
        assert_eq!(e.effective_rank(), 0);
    }
}
