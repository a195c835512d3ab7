// src/plan/mod.rs

//! Plan data model and planning collaborators.
//!
//! - [`task`] defines tasks, statuses and per-task records.
//! - [`model`] holds the validated, immutable [`ExecutionPlan`].
//! - [`graph`] keeps dependency adjacency for scheduling.
//! - [`planner`] turns requirements into plans.

pub mod graph;
pub mod model;
pub mod planner;
pub mod task;
mod validate;

pub use graph::DagGraph;
pub use model::{ExecutionPlan, RawPlan};
pub use planner::{HeuristicPlanner, LlmPlanner, Planner};
pub use task::{Effort, RetryRecord, Task, TaskId, TaskOutput, TaskResult, TaskStatus};
