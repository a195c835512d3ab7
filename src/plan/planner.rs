// src/plan/planner.rs

//! Planning collaborators: turn free-text requirements into an
//! [`ExecutionPlan`].

use std::fmt::Debug;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::errors::{Result, TaskfleetError};
use crate::llm::LlmClient;
use crate::plan::model::{ExecutionPlan, RawPlan};
use crate::plan::task::{Effort, Task};
use crate::types::BoxFuture;

/// Anything that can produce a validated plan for a budget of `M` workers.
pub trait Planner: Send + Sync + Debug {
    fn plan<'a>(&'a self, requirements: &'a str, budget: usize) -> BoxFuture<'a, Result<ExecutionPlan>>;
}

/// Splits requirements on list markers, line breaks and sentence ends.
static CLAUSE_SPLIT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^\s*(?:[-*]|\d+[.)])\s+)|[;\n]|\.\s+").ok());

/// Deterministic planner used in tests and offline runs.
///
/// One task per requirement clause. When there is more than one clause an
/// extra integration task depending on all of them is appended.
#[derive(Debug, Clone, Default)]
pub struct HeuristicPlanner;

impl HeuristicPlanner {
    pub fn split_clauses(requirements: &str) -> Vec<String> {
        let pieces: Vec<&str> = match CLAUSE_SPLIT.as_ref() {
            Some(re) => re.split(requirements).collect(),
            None => vec![requirements],
        };

        pieces
            .into_iter()
            .map(|p| p.trim().trim_end_matches('.').trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn build(&self, requirements: &str, budget: usize) -> Result<ExecutionPlan> {
        let clauses = Self::split_clauses(requirements);
        let count = clauses.len();

        let mut tasks: Vec<Task> = clauses
            .into_iter()
            .enumerate()
            .map(|(i, clause)| {
                let mut task = Task::new(format!("task_{}", i + 1), clause.clone());
                task.name = short_name(&clause);
                task
            })
            .collect();

        if count > 1 {
            let mut integrate = Task::new(
                format!("task_{}", count + 1),
                "Integrate the results of all previous tasks and verify they work together",
            );
            integrate.name = "Integration".to_string();
            integrate.dependencies = tasks.iter().map(|t| t.id.clone()).collect();
            integrate.effort = Effort::Low;
            tasks.push(integrate);
        }

        debug!(tasks = tasks.len(), budget, "heuristic plan built");

        ExecutionPlan::build(
            requirements,
            budget,
            RawPlan {
                tasks,
                execution_strategy: Some(format!(
                    "{count} independent clause task(s) on up to {budget} workers, then integration"
                )),
                ..RawPlan::default()
            },
        )
    }
}

impl Planner for HeuristicPlanner {
    fn plan<'a>(&'a self, requirements: &'a str, budget: usize) -> BoxFuture<'a, Result<ExecutionPlan>> {
        Box::pin(async move { self.build(requirements, budget) })
    }
}

fn short_name(clause: &str) -> String {
    let words: Vec<&str> = clause.split_whitespace().take(6).collect();
    words.join(" ")
}

/// Planner that asks the LLM for a JSON plan.
#[derive(Debug, Clone)]
pub struct LlmPlanner {
    client: Arc<dyn LlmClient>,
}

impl LlmPlanner {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn prompt(requirements: &str, budget: usize) -> String {
        format!(
            r#"You are planning work for {budget} parallel executors.

Break the following requirements into independent tasks. The number of tasks
may exceed the number of executors; executors pull ready tasks from a queue.
Only add a dependency when a task genuinely needs another task's output.

REQUIREMENTS:
{requirements}

Respond with a single JSON object in a ```json block, shaped like:

```json
{{
  "tasks": [
    {{
      "id": "task_1",
      "name": "short name",
      "description": "what to build",
      "priority": 5,
      "estimated_effort": "low|medium|high"
    }}
  ],
  "dependencies": {{"task_2": ["task_1"]}},
  "execution_strategy": "one sentence",
  "notes": "optional"
}}
```

Task ids may only use letters, digits, `_`, `-` and `.`.
Priority ranges from 1 (lowest) to 5 (highest)."#
        )
    }
}

impl Planner for LlmPlanner {
    fn plan<'a>(&'a self, requirements: &'a str, budget: usize) -> BoxFuture<'a, Result<ExecutionPlan>> {
        Box::pin(async move {
            info!(budget, "requesting plan from LLM");
            let response = self
                .client
                .complete(&Self::prompt(requirements, budget), None)
                .await
                .map_err(|e| TaskfleetError::Planning(format!("planner call failed: {e}")))?;

            let raw = parse_plan_response(&response)?;
            ExecutionPlan::build(requirements, budget, raw)
        })
    }
}

static JSON_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").ok());

/// Pull a [`RawPlan`] out of free-form LLM output.
///
/// Looks for a fenced ```json block first, then falls back to the outermost
/// `{ ... }` span.
pub fn parse_plan_response(response: &str) -> Result<RawPlan> {
    let fenced = JSON_FENCE
        .as_ref()
        .and_then(|re| re.captures(response))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());

    let body = match fenced {
        Some(body) => body,
        None => {
            let start = response.find('{');
            let end = response.rfind('}');
            match (start, end) {
                (Some(s), Some(e)) if s < e => &response[s..=e],
                _ => {
                    warn!("LLM response contained no JSON object");
                    return Err(TaskfleetError::Planning(
                        "planner response contained no JSON plan".to_string(),
                    ));
                }
            }
        }
    };

    serde_json::from_str(body)
        .map_err(|e| TaskfleetError::Planning(format!("planner returned malformed JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::task::TaskStatus;

    #[test]
    fn clauses_split_on_lists_and_sentences() {
        let clauses = HeuristicPlanner::split_clauses(
            "Build a REST API. Add a web frontend; write tests\n- deploy script",
        );
        assert_eq!(
            clauses,
            vec!["Build a REST API", "Add a web frontend", "write tests", "deploy script"]
        );
    }

    #[test]
    fn heuristic_plan_adds_integration_task() {
        let plan = HeuristicPlanner.build("auth service. billing service", 2).unwrap();
        let ids: Vec<_> = plan.tasks().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task_1", "task_2", "task_3"]);
        assert_eq!(plan.tasks()[2].dependencies, vec!["task_1", "task_2"]);
        assert!(plan.tasks().iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[test]
    fn single_clause_gives_single_task() {
        let plan = HeuristicPlanner.build("a calculator", 3).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.tasks()[0].description, "a calculator");
    }

    #[test]
    fn blank_requirements_fail_planning() {
        let err = HeuristicPlanner.build("   ", 1).unwrap_err();
        assert!(matches!(err, TaskfleetError::Planning(_)));
    }

    #[test]
    fn parses_fenced_plan_with_top_level_dependencies() {
        let response = r#"Here is the plan:
```json
{
  "tasks": [
    {"id": "task_1", "name": "db", "description": "schema", "priority": 5},
    {"id": "task_2", "name": "api", "description": "endpoints", "priority": 3}
  ],
  "dependencies": {"task_2": ["task_1"]},
  "execution_strategy": "db first"
}
```
Good luck."#;
        let raw = parse_plan_response(response).unwrap();
        let plan = ExecutionPlan::build("req", 2, raw).unwrap();
        assert_eq!(plan.strategy(), "db first");
        assert_eq!(plan.task("task_2").unwrap().dependencies, vec!["task_1"]);
        assert_eq!(plan.task("task_1").unwrap().priority, 5);
    }

    #[test]
    fn parses_bare_json_and_rejects_garbage() {
        let raw = parse_plan_response(r#"sure {"tasks":[{"id":"a","description":"x"}]} done"#).unwrap();
        assert_eq!(raw.tasks.len(), 1);

        assert!(matches!(
            parse_plan_response("no plan here"),
            Err(TaskfleetError::Planning(_))
        ));
        assert!(matches!(
            parse_plan_response("{not json}"),
            Err(TaskfleetError::Planning(_))
        ));
    }
}
