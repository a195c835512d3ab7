// src/plan/graph.rs

use std::collections::HashMap;

use crate::plan::task::{Task, TaskId};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    /// Position of the task in the plan (declaration order).
    index: usize,
    /// Direct dependencies: tasks that must complete before this one can run.
    deps: Vec<TaskId>,
    /// Direct dependents, in plan order.
    dependents: Vec<TaskId>,
}

/// In-memory dependency graph keyed by task id.
///
/// Acyclicity and reference validity are checked when the plan is built
/// (see [`crate::plan::validate`]); this type only keeps adjacency
/// information for scheduling and diagnostics.
#[derive(Debug, Clone, Default)]
pub struct DagGraph {
    nodes: HashMap<TaskId, DagNode>,
    order: Vec<TaskId>,
}

impl DagGraph {
    /// Build the graph from tasks in declaration order.
    ///
    /// Assumes that every dependency refers to a task in `tasks`.
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut nodes: HashMap<TaskId, DagNode> = HashMap::new();

        for (index, task) in tasks.iter().enumerate() {
            nodes.insert(
                task.id.clone(),
                DagNode {
                    index,
                    deps: task.dependencies.clone(),
                    dependents: Vec::new(),
                },
            );
        }

        // Walking tasks in order keeps every dependents list in plan order.
        for task in tasks {
            for dep in &task.dependencies {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    if !dep_node.dependents.contains(&task.id) {
                        dep_node.dependents.push(task.id.clone());
                    }
                }
            }
        }

        Self {
            nodes,
            order: tasks.iter().map(|t| t.id.clone()).collect(),
        }
    }

    /// Task ids in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.get(id).map(|n| n.index)
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, id: &str) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a task, in plan order.
    pub fn dependents_of(&self, id: &str) -> &[TaskId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every task that transitively depends on `id`, excluding `id` itself.
    pub fn transitive_dependents(&self, id: &str) -> Vec<TaskId> {
        let mut out: Vec<TaskId> = Vec::new();
        let mut stack: Vec<&str> = self.dependents_of(id).iter().map(|s| s.as_str()).collect();

        while let Some(name) = stack.pop() {
            if out.iter().any(|seen| seen == name) {
                continue;
            }
            out.push(name.to_string());
            stack.extend(self.dependents_of(name).iter().map(|s| s.as_str()));
        }

        out.sort_by_key(|name| self.index_of(name).unwrap_or(usize::MAX));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        let mut t = Task::new(id, format!("do {id}"));
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t
    }

    #[test]
    fn dependents_follow_plan_order() {
        let tasks = vec![
            task("a", &[]),
            task("c", &["a"]),
            task("b", &["a"]),
            task("d", &["b", "c"]),
        ];
        let graph = DagGraph::from_tasks(&tasks);

        assert_eq!(graph.dependents_of("a"), ["c".to_string(), "b".to_string()]);
        assert_eq!(graph.dependencies_of("d"), ["b".to_string(), "c".to_string()]);
        assert_eq!(graph.index_of("b"), Some(2));
        assert_eq!(graph.tasks().collect::<Vec<_>>(), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn transitive_dependents_are_deduplicated() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
            task("e", &[]),
        ];
        let graph = DagGraph::from_tasks(&tasks);

        assert_eq!(graph.transitive_dependents("a"), vec!["b", "c", "d"]);
        assert!(graph.transitive_dependents("e").is_empty());
    }
}
