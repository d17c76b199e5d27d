//! Per-task completion slots with condvar-based waiting.
//!
//! Every submitted task gets a slot resolved exactly once with its terminal
//! result; `wait` parks the caller (via the blocking pool when async) until
//! the slot resolves or the timeout elapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::{SchedulerError, TaskId, TaskResult};

struct Slot {
    result: Option<TaskResult>,
}

type Entry = Arc<(Mutex<Slot>, Condvar)>;

/// Completion slot map. Results stay claimable until the slot is removed, so
/// repeated waits on the same task return the same terminal record.
#[derive(Default)]
pub struct CompletionHub {
    entries: RwLock<HashMap<TaskId, Entry>>,
}

impl CompletionHub {
    /// Empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the slot for a task at submission.
    pub fn create_slot(&self, task_id: TaskId) {
        let entry: Entry = Arc::new((Mutex::new(Slot { result: None }), Condvar::new()));
        self.entries.write().insert(task_id, entry);
    }

    /// Resolve a slot. The first resolution wins; later calls are ignored so
    /// one logical task never yields two results.
    pub fn resolve(&self, result: TaskResult) {
        let entry = self.entries.read().get(&result.task_id).cloned();
        if let Some(entry) = entry {
            let (slot, condvar) = entry.as_ref();
            let mut guard = slot.lock();
            if guard.result.is_none() {
                guard.result = Some(result);
                condvar.notify_all();
            } else {
                tracing::debug!(
                    task = result.task_id,
                    "duplicate resolution ignored"
                );
            }
        }
    }

    /// Non-blocking result check.
    #[must_use]
    pub fn try_get(&self, task_id: TaskId) -> Option<TaskResult> {
        let entry = self.entries.read().get(&task_id).cloned()?;
        let guard = entry.0.lock();
        guard.result.clone()
    }

    /// Block until the slot resolves or the timeout elapses.
    pub fn wait_blocking(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<TaskResult, SchedulerError> {
        let entry = self
            .entries
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(SchedulerError::UnknownTask(task_id))?;
        let (slot, condvar) = entry.as_ref();
        let deadline = Instant::now() + timeout;
        let mut guard = slot.lock();
        loop {
            if let Some(result) = guard.result.clone() {
                return Ok(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SchedulerError::ResultTimeout(task_id));
            }
            // Spurious wakeups loop back around.
            let _ = condvar.wait_for(&mut guard, deadline - now);
        }
    }

    /// Async wait: parks the condvar wait on the blocking pool, like the
    /// worker-pool retrieval path.
    pub async fn wait(
        &self,
        task_id: TaskId,
        timeout: Duration,
    ) -> Result<TaskResult, SchedulerError> {
        if let Some(result) = self.try_get(task_id) {
            return Ok(result);
        }
        let entry = self
            .entries
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(SchedulerError::UnknownTask(task_id))?;

        let joined = tokio::task::spawn_blocking(move || {
            let (slot, condvar) = entry.as_ref();
            let deadline = Instant::now() + timeout;
            let mut guard = slot.lock();
            loop {
                if let Some(result) = guard.result.clone() {
                    return Some(result);
                }
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                let _ = condvar.wait_for(&mut guard, deadline - now);
            }
        })
        .await;

        match joined {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Err(SchedulerError::ResultTimeout(task_id)),
            Err(_) => Err(SchedulerError::Shutdown),
        }
    }

    /// Drop a slot, releasing its memory. Waiters already parked still hold
    /// the entry and resolve normally.
    pub fn remove(&self, task_id: TaskId) {
        self.entries.write().remove(&task_id);
    }

    /// Slots currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no slots are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskOutcome;

    fn completed(task_id: TaskId) -> TaskResult {
        TaskResult {
            task_id,
            outcome: TaskOutcome::Completed,
            value: Some(serde_json::json!(42)),
            error: None,
            execution_time: Duration::from_millis(5),
            usage: crate::core::ResourceUsage::default(),
            worker_id: Some(0),
            attempts: 1,
        }
    }

    #[test]
    fn test_resolve_then_wait() {
        let hub = CompletionHub::new();
        hub.create_slot(1);
        hub.resolve(completed(1));
        let r = hub.wait_blocking(1, Duration::from_millis(10)).unwrap();
        assert_eq!(r.outcome, TaskOutcome::Completed);
        // A second wait sees the same record.
        assert!(hub.wait_blocking(1, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_wait_timeout() {
        let hub = CompletionHub::new();
        hub.create_slot(2);
        let err = hub.wait_blocking(2, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, SchedulerError::ResultTimeout(2)));
    }

    #[test]
    fn test_unknown_task() {
        let hub = CompletionHub::new();
        let err = hub.wait_blocking(99, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask(99)));
    }

    #[test]
    fn test_first_resolution_wins() {
        let hub = CompletionHub::new();
        hub.create_slot(3);
        hub.resolve(completed(3));
        let mut second = completed(3);
        second.outcome = TaskOutcome::Failed;
        hub.resolve(second);
        let r = hub.try_get(3).unwrap();
        assert_eq!(r.outcome, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn test_async_wait_cross_thread() {
        let hub = Arc::new(CompletionHub::new());
        hub.create_slot(4);
        let resolver = Arc::clone(&hub);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            resolver.resolve(completed(4));
        });
        let r = hub.wait(4, Duration::from_secs(2)).await.unwrap();
        assert_eq!(r.task_id, 4);
    }
}
