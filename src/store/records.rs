// src/store/records.rs

//! Records exchanged through the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exec::executor::ExecutorSpec;
use crate::plan::task::{Task, TaskId};

/// Everything a worker needs to run one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub run_id: String,
    pub requirements: String,
    pub task: Task,
    pub executor: ExecutorSpec,
}

/// Lifecycle of one submitted job (container, cluster job) as recorded in
/// the job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobPhase {
    pub fn is_final(self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed | JobPhase::Cancelled)
    }
}

/// Row of `jobs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Backend handle; empty until the worker or submitter knows it.
    #[serde(default)]
    pub job_id: String,
    pub task_id: TaskId,
    pub attempt: u32,
    pub phase: JobPhase,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn submitted(job_id: impl Into<String>, task_id: impl Into<TaskId>, attempt: u32) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            attempt,
            phase: JobPhase::Submitted,
            updated_at: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase: JobPhase) -> Self {
        self.phase = phase;
        self.updated_at = Utc::now();
        self
    }

    /// Fold a newer row for the same task attempt into this one.
    ///
    /// A final phase is never overwritten by a non-final one, so a late
    /// "running" update from a worker cannot undo a recorded outcome.
    pub fn merge(&mut self, newer: JobRecord) {
        if !newer.job_id.is_empty() {
            self.job_id = newer.job_id;
        }
        if !self.phase.is_final() || newer.phase.is_final() {
            self.phase = newer.phase;
        }
        self.updated_at = newer.updated_at;
    }
}

/// Outcome of one attempt as written by an out-of-process worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub task_id: TaskId,
    pub attempt: u32,
    pub success: bool,
    /// Paths (directory stores) or object keys (bucket stores).
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub host: Option<String>,
    pub finished_at: DateTime<Utc>,
}
