// src/plan/task.rs

//! Task data model: definitions, lifecycle states and per-task records.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical task identifier type; unique within a plan.
pub type TaskId = String;

/// Advisory effort estimate attached by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Effort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Effort::Low),
            "medium" => Ok(Effort::Medium),
            "high" => Ok(Effort::High),
            other => Err(format!(
                "invalid effort: {other} (expected low, medium or high)"
            )),
        }
    }
}

/// Lifecycle state of a task.
///
/// Tasks only ever move forward through these states (with the single
/// `Running -> Retrying -> Ready` loop for failed attempts); they are never
/// removed from a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies completed; waiting for a free worker.
    Ready,
    /// Dispatched to a worker.
    Running,
    Completed,
    /// Permanently failed after exhausting retries.
    Failed,
    /// Failed attempt waiting out its backoff delay.
    Retrying,
    /// Can never run because a dependency permanently failed.
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Short human-readable name; falls back to the id when empty.
    #[serde(default)]
    pub name: String,

    pub description: String,

    /// Ids of tasks that must complete before this one may run.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    /// Higher values run first when several tasks are ready.
    #[serde(default)]
    pub priority: i32,

    #[serde(default, alias = "estimated_effort")]
    pub effort: Effort,

    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: description.into(),
            dependencies: Vec::new(),
            priority: 0,
            effort: Effort::default(),
            status: TaskStatus::Pending,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Attempt bookkeeping for one task, consulted by the retry policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Number of attempts started so far.
    pub attempts: u32,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl RetryRecord {
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.last_attempt = Some(Utc::now());
        self.attempts
    }
}

/// What a successful task attempt hands back to the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Final per-task record, written once when a task reaches `Completed` or
/// permanently `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Wall-clock time of the final attempt, in milliseconds.
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
    pub retry: RetryRecord,
    /// Backend handle of the worker that ran the final attempt.
    #[serde(default)]
    pub worker: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn task_deserializes_with_defaults_and_aliases() {
        let task: Task = serde_json::from_str(
            r#"{"id":"task_1","description":"schema","estimated_effort":"high"}"#,
        )
        .unwrap();
        assert_eq!(task.effort, Effort::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 0);
        assert_eq!(task.display_name(), "task_1");
    }

    #[test]
    fn record_attempt_counts_up() {
        let mut record = RetryRecord::default();
        assert_eq!(record.record_attempt(), 1);
        assert_eq!(record.record_attempt(), 2);
        assert!(record.last_attempt.is_some());
    }
}
