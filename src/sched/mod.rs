// src/sched/mod.rs

//! Backend-independent scheduling core.
//!
//! - [`scheduler`] contains the deterministic task-queue state machine.
//! - [`state_manager`] performs ready-set and blocking transitions.
//! - [`task_info`] holds per-task state and the attempt report types.
//! - [`scheduler_step`] defines the result type for scheduler steps.
//! - [`retry`] decides whether and when failed tasks are retried.

pub mod retry;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task_info;

pub use retry::{ExponentialBackoff, RetryPolicy};
pub use scheduler::{RunOutcome, Scheduler};
pub use scheduler_step::SchedulerStep;
pub use task_info::{AttemptOutcome, AttemptReport, Dispatch, TaskStatusRecord};
