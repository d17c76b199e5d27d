//! Task scheduler: queues, admission policy, aging, deadlines, preemption.

pub mod algorithm;
pub mod queue;
pub mod scheduler;

pub use algorithm::order_candidates;
pub use queue::{QueuedTask, TaskQueue};
pub use scheduler::{
    CancelOutcome, DeferReason, RejectReason, RunningEntry, SchedulingDecision, TaskScheduler,
    TickReport,
};
