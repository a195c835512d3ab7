// src/summary.rs

//! Aggregated view of a finished run.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::model::ExecutionPlan;
use crate::plan::task::{TaskId, TaskStatus};
use crate::sched::RunOutcome;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub id: TaskId,
    pub name: String,
    pub attempts: u32,
    pub artifacts: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedTask {
    pub id: TaskId,
    pub name: String,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub id: TaskId,
    pub name: String,
    /// Direct dependencies that did not complete.
    pub waiting_on: Vec<TaskId>,
}

/// Contents of `execution_summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub backend: String,
    pub max_workers: usize,
    pub total_tasks: usize,
    pub completed: Vec<CompletedTask>,
    pub failed: Vec<FailedTask>,
    pub blocked: Vec<BlockedTask>,
    /// Completed tasks as a percentage of all tasks.
    pub success_rate: f64,
    pub artifact_count: usize,
    pub elapsed_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when every task completed.
    pub success: bool,
}

impl RunSummary {
    pub fn build(
        run_id: &str,
        backend: &str,
        max_workers: usize,
        plan: &ExecutionPlan,
        outcome: &RunOutcome,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut blocked = Vec::new();

        for task in plan.tasks() {
            let status = outcome.status_of(&task.id).unwrap_or(task.status);
            let result = outcome.result_for(&task.id);
            let attempts = result.map(|r| r.retry.attempts).unwrap_or_else(|| {
                outcome
                    .statuses
                    .iter()
                    .find(|s| s.id == task.id)
                    .map_or(0, |s| s.attempts)
            });

            match status {
                TaskStatus::Completed => completed.push(CompletedTask {
                    id: task.id.clone(),
                    name: task.display_name().to_string(),
                    attempts,
                    artifacts: result.map_or(0, |r| r.artifacts.len()),
                    duration_ms: result.map_or(0, |r| r.duration_ms),
                }),
                TaskStatus::Blocked => blocked.push(BlockedTask {
                    id: task.id.clone(),
                    name: task.display_name().to_string(),
                    waiting_on: task
                        .dependencies
                        .iter()
                        .filter(|d| outcome.status_of(d) != Some(TaskStatus::Completed))
                        .cloned()
                        .collect(),
                }),
                // Anything else at this point did not finish successfully.
                _ => failed.push(FailedTask {
                    id: task.id.clone(),
                    name: task.display_name().to_string(),
                    attempts,
                    error: result
                        .and_then(|r| r.error.clone())
                        .unwrap_or_else(|| format!("ended in state {status}")),
                }),
            }
        }

        let total_tasks = plan.len();
        let success_rate = if total_tasks == 0 {
            0.0
        } else {
            completed.len() as f64 * 100.0 / total_tasks as f64
        };
        let artifact_count = outcome.results.iter().map(|r| r.artifacts.len()).sum();
        let success = failed.is_empty() && blocked.is_empty();

        Self {
            run_id: run_id.to_string(),
            backend: backend.to_string(),
            max_workers,
            total_tasks,
            completed,
            failed,
            blocked,
            success_rate,
            artifact_count,
            elapsed_secs: elapsed.as_secs_f64(),
            started_at,
            finished_at: Utc::now(),
            success,
        }
    }

    /// Human-readable report for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {} ({} backend, {} workers)", self.run_id, self.backend, self.max_workers);
        let _ = writeln!(
            out,
            "  tasks: {} total, {} completed, {} failed, {} blocked ({:.1}% success)",
            self.total_tasks,
            self.completed.len(),
            self.failed.len(),
            self.blocked.len(),
            self.success_rate
        );
        let _ = writeln!(out, "  artifacts: {}", self.artifact_count);
        let _ = writeln!(out, "  elapsed: {:.1}s", self.elapsed_secs);

        if !self.completed.is_empty() {
            let _ = writeln!(out, "\nCompleted:");
            for t in &self.completed {
                let _ = writeln!(out, "  - {} ({}) attempts={}", t.id, t.name, t.attempts);
            }
        }
        if !self.failed.is_empty() {
            let _ = writeln!(out, "\nFailed:");
            for t in &self.failed {
                let first_line = t.error.lines().next().unwrap_or_default();
                let _ = writeln!(out, "  - {} ({}) attempts={}: {first_line}", t.id, t.name, t.attempts);
            }
        }
        if !self.blocked.is_empty() {
            let _ = writeln!(out, "\nBlocked:");
            for t in &self.blocked {
                let _ = writeln!(out, "  - {} ({}) waiting on {}", t.id, t.name, t.waiting_on.join(", "));
            }
        }
        out
    }
}
