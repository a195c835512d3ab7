// src/sched/scheduler_step.rs

//! Result types for individual scheduler transitions.

use std::time::Duration;

use crate::plan::task::TaskId;

/// Structured result of feeding one finished attempt into the scheduler.
///
/// Backends use it for logging and persistence; tests use it to make
/// assertions about what changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerStep {
    /// Tasks that joined the ready set as a result of this step.
    pub newly_ready: Vec<TaskId>,
    /// Task that failed permanently in this step, if any.
    pub newly_failed: Option<TaskId>,
    /// Dependents that became `Blocked` because of `newly_failed`.
    pub newly_blocked: Vec<TaskId>,
    /// Backoff before the retried task becomes ready again.
    pub retry_in: Option<Duration>,
    /// Whether every task is now terminal.
    pub run_finished: bool,
}
