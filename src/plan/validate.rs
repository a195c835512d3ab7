// src/plan/validate.rs

use std::collections::{BTreeMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{Result, TaskfleetError};
use crate::plan::task::{Task, TaskId, TaskStatus};

/// Validate raw planner output and return the normalised task list.
///
/// This checks:
/// - the budget is at least one worker
/// - there is at least one task
/// - task ids are non-empty, unique and usable as a single path component
/// - every dependency refers to an existing task
/// - no task depends on itself
/// - the dependency graph has no cycles
///
/// Top-level dependency entries are merged into each task's own list, and
/// every task's status is reset to `Pending`.
pub(crate) fn validate_raw_plan(
    mut tasks: Vec<Task>,
    dependency_map: BTreeMap<TaskId, Vec<TaskId>>,
    budget: usize,
) -> Result<Vec<Task>> {
    ensure_budget(budget)?;
    ensure_has_tasks(&tasks)?;
    ensure_unique_ids(&tasks)?;
    merge_dependency_map(&mut tasks, dependency_map)?;
    validate_task_dependencies(&tasks)?;
    validate_dag(&tasks)?;

    for task in tasks.iter_mut() {
        task.status = TaskStatus::Pending;
    }

    Ok(tasks)
}

fn ensure_budget(budget: usize) -> Result<()> {
    if budget == 0 {
        return Err(TaskfleetError::Planning(
            "executor budget must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn ensure_has_tasks(tasks: &[Task]) -> Result<()> {
    if tasks.is_empty() {
        return Err(TaskfleetError::Planning(
            "plan must contain at least one task".to_string(),
        ));
    }
    Ok(())
}

fn ensure_unique_ids(tasks: &[Task]) -> Result<()> {
    let mut seen = HashSet::new();
    for task in tasks {
        if task.id.trim().is_empty() {
            return Err(TaskfleetError::Planning(
                "plan contains a task with an empty id".to_string(),
            ));
        }
        if !is_path_safe_id(&task.id) {
            return Err(TaskfleetError::Planning(format!(
                "task id '{}' may only contain letters, digits, '_', '-' and '.'",
                task.id
            )));
        }
        if !seen.insert(task.id.as_str()) {
            return Err(TaskfleetError::Planning(format!(
                "duplicate task id '{}' in plan",
                task.id
            )));
        }
    }
    Ok(())
}

/// Ids name directories and state keys, so they must not escape their parent.
fn is_path_safe_id(id: &str) -> bool {
    id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn merge_dependency_map(
    tasks: &mut [Task],
    dependency_map: BTreeMap<TaskId, Vec<TaskId>>,
) -> Result<()> {
    for (id, deps) in dependency_map {
        let task = tasks.iter_mut().find(|t| t.id == id).ok_or_else(|| {
            TaskfleetError::Planning(format!(
                "dependency map refers to unknown task '{id}'"
            ))
        })?;

        for dep in deps {
            if !task.dependencies.contains(&dep) {
                task.dependencies.push(dep);
            }
        }
    }

    for task in tasks.iter_mut() {
        let mut seen = HashSet::new();
        task.dependencies.retain(|d| seen.insert(d.clone()));
    }

    Ok(())
}

fn validate_task_dependencies(tasks: &[Task]) -> Result<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

    for task in tasks {
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(TaskfleetError::Planning(format!(
                    "task '{}' cannot depend on itself",
                    task.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(TaskfleetError::Planning(format!(
                    "task '{}' has unknown dependency '{}'",
                    task.id, dep
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(tasks: &[Task]) -> Result<()> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for task in tasks {
        graph.add_node(task.id.as_str());
    }

    for task in tasks {
        for dep in &task.dependencies {
            graph.add_edge(dep.as_str(), task.id.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(TaskfleetError::Planning(format!(
            "cycle detected in task dependencies involving task '{}'",
            cycle.node_id()
        ))),
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

    fn planning_message(err: TaskfleetError) -> String {
        match err {
            TaskfleetError::Planning(msg) => msg,
            other => panic!("expected planning error, got {other:?}"),
        }
    }

    #[test]
    fn two_task_cycle_is_rejected() {
        let err = validate_raw_plan(
            vec![task("T1", &["T2"]), task("T2", &["T1"])],
            BTreeMap::new(),
            2,
        )
        .unwrap_err();
        assert!(planning_message(err).contains("cycle detected"));
    }

    #[test]
    fn cycle_through_dependency_map_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), vec!["c".to_string()]);
        let err = validate_raw_plan(
            vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])],
            map,
            1,
        )
        .unwrap_err();
        assert!(planning_message(err).contains("cycle"));
    }

    #[test]
    fn unknown_and_self_dependencies_are_rejected() {
        let err = validate_raw_plan(vec![task("a", &["ghost"])], BTreeMap::new(), 1).unwrap_err();
        assert!(planning_message(err).contains("unknown dependency 'ghost'"));

        let err = validate_raw_plan(vec![task("a", &["a"])], BTreeMap::new(), 1).unwrap_err();
        assert!(planning_message(err).contains("itself"));
    }

    #[test]
    fn empty_plan_duplicates_and_zero_budget_are_rejected() {
        assert!(validate_raw_plan(Vec::new(), BTreeMap::new(), 1).is_err());
        assert!(validate_raw_plan(vec![task("a", &[]), task("a", &[])], BTreeMap::new(), 1).is_err());
        assert!(validate_raw_plan(vec![task("a", &[])], BTreeMap::new(), 0).is_err());
    }

    #[test]
    fn ids_that_are_not_plain_names_are_rejected() {
        for bad in ["../escaped", "/tmp/outside", "a/b", "..", ".", "has space", "a\\b"] {
            let err = validate_raw_plan(vec![task(bad, &[])], BTreeMap::new(), 1).unwrap_err();
            assert!(planning_message(err).contains("may only contain"), "{bad}");
        }

        let tasks = validate_raw_plan(
            vec![task("task_1", &[]), task("api-v2.1", &["task_1"])],
            BTreeMap::new(),
            1,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn dependency_map_is_merged_without_duplicates() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), vec!["a".to_string(), "a".to_string()]);
        let mut running = task("b", &["a"]);
        running.status = TaskStatus::Running;

        let tasks = validate_raw_plan(vec![task("a", &[]), running], map, 1).unwrap();
        assert_eq!(tasks[1].dependencies, vec!["a".to_string()]);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }
}
