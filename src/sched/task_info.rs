// src/sched/task_info.rs

//! Per-task scheduling state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::plan::task::{RetryRecord, Task, TaskId, TaskResult, TaskStatus};

/// Mutable scheduling state for one task (internal to the scheduler).
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Position in the plan; used as the tie-breaker between equal priorities.
    pub index: usize,
    pub task: Task,
    pub retry: RetryRecord,
    pub last_error: Option<String>,
    /// Written once when the task reaches `Completed` or `Failed`.
    pub result: Option<TaskResult>,
}

impl TaskInfo {
    pub fn new(index: usize, task: Task) -> Self {
        Self {
            index,
            task,
            retry: RetryRecord::default(),
            last_error: None,
            result: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status
    }
}

/// A task handed to a worker, together with its attempt number.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub task: Task,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Row of the persisted task-status table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl From<&TaskInfo> for TaskStatusRecord {
    fn from(info: &TaskInfo) -> Self {
        Self {
            id: info.task.id.clone(),
            status: info.task.status,
            attempts: info.retry.attempts,
            last_error: info.last_error.clone(),
        }
    }
}

/// How a finished attempt went, as reported by a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded {
        artifacts: Vec<std::path::PathBuf>,
    },
    Failed {
        error: String,
    },
}

/// A finished attempt, ready to be fed back into the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptReport {
    pub task_id: TaskId,
    pub attempt: u32,
    /// Backend handle of the worker that ran it.
    pub worker: String,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
}
