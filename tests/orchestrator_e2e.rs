use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::tempdir;

use taskfleet::errors::TaskfleetError;
use taskfleet::orchestrator::{Orchestrator, PLAN_FILE, SUMMARY_FILE, render_plan};
use taskfleet::summary::RunSummary;
use taskfleet::types::PlannerKind;
use taskfleet_test_utils::{
    ConfigBuilder, RecordingExecutor, ScriptedRunner, init_tracing, success, with_timeout,
};

const REQUIREMENTS: &str = "Build a REST API. Add a web frontend. Write integration tests";

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn simulated_run_writes_plan_summary_and_artifacts() {
    init_tracing();
    let dir = tempdir().unwrap();
    let cfg = ConfigBuilder::new(dir.path()).max_workers(2).build();
    let orchestrator = Orchestrator::new(cfg, Arc::new(ScriptedRunner::new()));

    let report = with_timeout(orchestrator.run(REQUIREMENTS, false)).await.unwrap();

    assert!(report.success());
    assert!(report.run_dir.starts_with(dir.path()));
    assert!(report.run_dir.ends_with(&report.run_id));
    // Three clause tasks plus the integration task.
    assert_eq!(report.plan.len(), 4);

    let plan = read_json(&report.run_dir.join(PLAN_FILE));
    assert_eq!(plan["run_id"], Value::from(report.run_id.clone()));
    assert_eq!(plan["backend"], Value::from("threading"));
    assert_eq!(plan["plan"]["tasks"].as_array().unwrap().len(), 4);

    let summary: RunSummary =
        serde_json::from_slice(&std::fs::read(report.run_dir.join(SUMMARY_FILE)).unwrap()).unwrap();
    assert_eq!(summary.total_tasks, 4);
    assert_eq!(summary.completed.len(), 4);
    assert_eq!(summary.success_rate, 100.0);
    assert_eq!(summary.artifact_count, 4);
    assert!(summary.success);

    for task in report.plan.tasks() {
        let artifact = report.run_dir.join("tasks").join(&task.id).join("result.md");
        assert!(artifact.is_file(), "missing {}", artifact.display());
    }
}

#[tokio::test]
async fn dry_run_only_plans() {
    let dir = tempdir().unwrap();
    let cfg = ConfigBuilder::new(dir.path()).build();
    let executor = RecordingExecutor::new(Duration::ZERO);
    let orchestrator =
        Orchestrator::new(cfg, Arc::new(ScriptedRunner::new())).with_executor(Arc::new(executor.clone()));

    let report = orchestrator.run(REQUIREMENTS, true).await.unwrap();

    assert!(report.outcome.is_none());
    assert!(report.success());
    assert!(report.run_dir.join(PLAN_FILE).is_file());
    assert!(!report.run_dir.join(SUMMARY_FILE).exists());
    assert!(executor.events().is_empty());

    let rendered = render_plan(&report.plan);
    assert!(rendered.starts_with("plan: 4 task(s), budget 5\n"), "{rendered}");
    assert!(rendered.contains("after: task_1, task_2, task_3"), "{rendered}");
}

#[tokio::test]
async fn failed_task_is_reported_and_dependents_blocked() {
    init_tracing();
    let dir = tempdir().unwrap();
    let cfg = ConfigBuilder::new(dir.path()).max_workers(3).build();
    let executor = RecordingExecutor::new(Duration::from_millis(2))
        .always_fail("task_2")
        .fail_first("task_3", 1);
    let orchestrator =
        Orchestrator::new(cfg, Arc::new(ScriptedRunner::new())).with_executor(Arc::new(executor.clone()));

    let report = with_timeout(orchestrator.run(REQUIREMENTS, false)).await.unwrap();
    let summary = report.summary.clone().unwrap();

    assert!(!report.success());
    assert_eq!(executor.attempts("task_2"), 3);
    assert_eq!(executor.attempts("task_3"), 2);
    assert_eq!(executor.attempts("task_4"), 0);

    let completed: Vec<_> = summary.completed.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(completed, vec!["task_1", "task_3"]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].id, "task_2");
    assert_eq!(summary.failed[0].attempts, 3);
    assert!(summary.failed[0].error.contains("scripted failure on attempt 3"));
    assert_eq!(summary.blocked.len(), 1);
    assert_eq!(summary.blocked[0].waiting_on, vec!["task_2"]);
    assert_eq!(summary.success_rate, 50.0);

    let rendered = summary.render();
    assert!(rendered.contains("task_2"), "{rendered}");
}

#[tokio::test]
async fn single_attempt_config_disables_retries() {
    let dir = tempdir().unwrap();
    let cfg = ConfigBuilder::new(dir.path()).max_retries(1).build();
    let executor = RecordingExecutor::new(Duration::ZERO).fail_first("task_1", 1);
    let orchestrator =
        Orchestrator::new(cfg, Arc::new(ScriptedRunner::new())).with_executor(Arc::new(executor.clone()));

    let report = with_timeout(orchestrator.run("just one thing", false)).await.unwrap();

    assert!(!report.success());
    assert_eq!(executor.attempts("task_1"), 1);
    assert_eq!(report.summary.unwrap().failed[0].attempts, 1);
}

#[tokio::test]
async fn overall_timeout_aborts_the_run() {
    let dir = tempdir().unwrap();
    let cfg = ConfigBuilder::new(dir.path()).timeout("50ms").build();
    let executor = RecordingExecutor::new(Duration::from_secs(30));
    let orchestrator =
        Orchestrator::new(cfg, Arc::new(ScriptedRunner::new())).with_executor(Arc::new(executor));

    let err = with_timeout(orchestrator.run(REQUIREMENTS, false)).await.unwrap_err();

    assert!(matches!(err, TaskfleetError::Backend(ref m) if m.contains("timed out")), "{err}");
}

#[tokio::test]
async fn llm_planner_plan_is_used() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner.respond(
        "claude",
        "--dangerously-skip-permissions",
        success(
            r#"Sure.
```json
{
  "tasks": [
    {"id": "db", "name": "Database", "description": "schema", "priority": 5},
    {"id": "api", "name": "API", "description": "endpoints", "priority": 3},
    {"id": "ui", "name": "UI", "description": "pages", "priority": 1}
  ],
  "dependencies": {"api": ["db"], "ui": ["api"]},
  "execution_strategy": "layer by layer"
}
```"#,
        ),
    );
    let cfg = ConfigBuilder::new(dir.path()).planner(PlannerKind::Llm).build();
    let orchestrator = Orchestrator::new(cfg, Arc::new(runner.clone()));

    let report = orchestrator.run("a todo app", true).await.unwrap();

    let ids: Vec<_> = report.plan.tasks().iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["db", "api", "ui"]);
    assert_eq!(report.plan.strategy(), "layer by layer");
    let call = &runner.calls()[0];
    assert_eq!(call.program, "claude");
    assert!(call.args.iter().any(|a| a.contains("a todo app")));
}

#[tokio::test]
async fn llm_planner_requires_the_cli() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner.without("claude");
    let cfg = ConfigBuilder::new(dir.path()).planner(PlannerKind::Llm).build();

    let err = Orchestrator::new(cfg, Arc::new(runner))
        .run("a todo app", true)
        .await
        .unwrap_err();
    assert!(matches!(err, TaskfleetError::Planning(ref m) if m.contains("claude")), "{err}");
}
