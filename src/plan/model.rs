// src/plan/model.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::plan::graph::DagGraph;
use crate::plan::task::{Task, TaskId};
use crate::plan::validate::validate_raw_plan;

/// Plan as produced by a planning collaborator, before validation.
///
/// Dependencies may be given per task (`"dependencies": [...]` on each task)
/// and/or as a top-level map from task id to dependency ids; the two are
/// merged during validation.
///
/// ```json
/// {
///   "tasks": [
///     {"id": "task_1", "name": "Schema", "description": "...", "priority": 3},
///     {"id": "task_2", "name": "API", "description": "..."}
///   ],
///   "dependencies": {"task_2": ["task_1"]},
///   "execution_strategy": "schema first, then API"
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPlan {
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,

    #[serde(default)]
    pub execution_strategy: Option<String>,

    #[serde(default)]
    pub notes: Option<String>,
}

/// A validated execution plan.
///
/// Invariants established by [`ExecutionPlan::build`]:
/// - at least one task, with unique non-empty ids
/// - every dependency refers to a task in the plan
/// - no task depends on itself, directly or transitively
/// - `budget >= 1`
///
/// The plan is immutable once built; per-task status lives in the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    requirements: String,
    budget: usize,
    strategy: String,
    notes: String,
    tasks: Vec<Task>,
    #[serde(skip)]
    graph: DagGraph,
}

impl ExecutionPlan {
    /// Validate a raw plan and freeze it.
    ///
    /// Any violation is reported as [`crate::errors::TaskfleetError::Planning`].
    pub fn build(requirements: impl Into<String>, budget: usize, raw: RawPlan) -> Result<Self> {
        let tasks = validate_raw_plan(raw.tasks, raw.dependencies, budget)?;
        let graph = DagGraph::from_tasks(&tasks);

        let strategy = raw
            .execution_strategy
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| {
                format!("task queue: {budget} workers pull ready tasks by priority")
            });

        Ok(Self {
            requirements: requirements.into(),
            budget,
            strategy,
            notes: raw.notes.unwrap_or_default(),
            tasks,
            graph,
        })
    }

    /// Convenience for callers that already hold a task list.
    pub fn from_tasks(requirements: impl Into<String>, budget: usize, tasks: Vec<Task>) -> Result<Self> {
        Self::build(
            requirements,
            budget,
            RawPlan {
                tasks,
                ..RawPlan::default()
            },
        )
    }

    pub fn requirements(&self) -> &str {
        &self.requirements
    }

    /// Declared executor budget `M`.
    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.graph.index_of(id).map(|i| &self.tasks[i])
    }

    pub fn graph(&self) -> &DagGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
