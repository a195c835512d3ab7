// src/sched/state_manager.rs

//! Ready-set and blocking transitions for the scheduler.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use tracing::debug;

use crate::plan::graph::DagGraph;
use crate::plan::task::{TaskId, TaskStatus};
use crate::sched::task_info::TaskInfo;

/// Ordering key of the ready set: highest priority first, then plan order.
pub type ReadyKey = (Reverse<i32>, usize);

pub fn ready_key(info: &TaskInfo) -> ReadyKey {
    (Reverse(info.task.priority), info.index)
}

/// Borrowed view over scheduler state that performs dependency-driven
/// transitions.
pub struct StateManager<'a> {
    graph: &'a DagGraph,
    tasks: &'a mut [TaskInfo],
    ready: &'a mut BTreeSet<ReadyKey>,
}

impl<'a> StateManager<'a> {
    pub fn new(
        graph: &'a DagGraph,
        tasks: &'a mut [TaskInfo],
        ready: &'a mut BTreeSet<ReadyKey>,
    ) -> Self {
        Self {
            graph,
            tasks,
            ready,
        }
    }

    /// Whether every dependency of the task at `index` is `Completed`.
    pub fn deps_completed(&self, index: usize) -> bool {
        deps_completed(self.graph, self.tasks, index)
    }

    /// Move `Pending` tasks whose dependencies are all `Completed` into the
    /// ready set. Only `candidates` are examined.
    ///
    /// Returns the ids that became ready, in plan order.
    pub fn promote_ready<'b>(&mut self, candidates: impl IntoIterator<Item = &'b str>) -> Vec<TaskId> {
        let mut indices: Vec<usize> = candidates
            .into_iter()
            .filter_map(|id| self.graph.index_of(id))
            .filter(|&i| self.tasks[i].status() == TaskStatus::Pending)
            .filter(|&i| self.deps_completed(i))
            .collect();
        indices.sort_unstable();
        indices.dedup();

        let mut promoted = Vec::with_capacity(indices.len());
        for i in indices {
            let info = &mut self.tasks[i];
            info.task.status = TaskStatus::Ready;
            self.ready.insert(ready_key(info));
            debug!(task = %info.task.id, priority = info.task.priority, "dependencies completed; task ready");
            promoted.push(info.task.id.clone());
        }
        promoted
    }

    /// Mark every transitive dependent of `failed` that has not finished as
    /// `Blocked`.
    ///
    /// Returns the newly blocked ids, in plan order.
    pub fn block_dependents(&mut self, failed: &str) -> Vec<TaskId> {
        let mut blocked = Vec::new();

        for id in self.graph.transitive_dependents(failed) {
            let Some(i) = self.graph.index_of(&id) else {
                continue;
            };
            let info = &mut self.tasks[i];
            if info.status().is_terminal() {
                continue;
            }
            if info.status() == TaskStatus::Ready {
                self.ready.remove(&ready_key(info));
            }
            info.task.status = TaskStatus::Blocked;
            debug!(task = %id, upstream = %failed, "task blocked by failed dependency");
            blocked.push(id);
        }

        blocked
    }
}

/// Free-function form of [`StateManager::deps_completed`] for shared access.
pub fn deps_completed(graph: &DagGraph, tasks: &[TaskInfo], index: usize) -> bool {
    let id = tasks[index].id();
    graph.dependencies_of(id).iter().all(|dep| {
        graph
            .index_of(dep)
            .is_some_and(|d| tasks[d].status() == TaskStatus::Completed)
    })
}
