use std::path::PathBuf;
use std::sync::Arc;

use tempfile::tempdir;

use taskfleet::backend::{RunContext, build_backend};
use taskfleet::errors::TaskfleetError;
use taskfleet::exec::{CommandRunner, SimulatedExecutor};
use taskfleet::plan::TaskStatus;
use taskfleet::types::BackendKind;
use taskfleet_test_utils::{
    ConfigBuilder, ScriptedRunner, TaskBuilder, failure, flag_value, init_tracing, plan, run_context,
    success, with_timeout, write_worker_report,
};

/// A docker CLI whose containers "run" the worker synchronously at
/// `docker run` time. Tasks whose id starts with `bad` always fail.
fn fake_docker() -> ScriptedRunner {
    let runner = ScriptedRunner::new();
    runner
        .respond("docker", "version", success("27.1.0\n"))
        .respond("docker", "image", success("[]"))
        .respond("docker", "rm", success(""))
        .respond("docker", "logs", success("Traceback (most recent call last):\nboom\n"))
        .handle(|spec| {
            if spec.program != "docker" || spec.args.first().map(String::as_str) != Some("run") {
                return None;
            }
            let state_mount = spec.args.iter().find(|a| a.ends_with(":/state"))?;
            let state_dir = PathBuf::from(state_mount.trim_end_matches(":/state"));
            let task = flag_value(&spec.args, "--task")?;
            let attempt: u32 = flag_value(&spec.args, "--attempt")?.parse().ok()?;

            let error = task.starts_with("bad").then_some("worker raised boom");
            write_worker_report(&state_dir, task, attempt, error);
            Some(success(&format!("{task}-{attempt}\n")))
        })
        .handle(|spec| {
            if spec.program != "docker" || spec.args.first().map(String::as_str) != Some("inspect") {
                return None;
            }
            let id = spec.args.last()?;
            Some(if id.starts_with("bad") {
                success("exited|1\n")
            } else {
                success("exited|0\n")
            })
        });
    runner
}

fn docker_run(run_dir: &std::path::Path) -> RunContext {
    run_context(run_dir)
}

#[tokio::test]
async fn runs_each_attempt_in_a_container() {
    init_tracing();
    let dir = tempdir().unwrap();
    let runner = fake_docker();
    let cfg = ConfigBuilder::new(dir.path()).backend(BackendKind::Docker).build();
    let run = docker_run(&dir.path().join("run"));
    let state_dir = run.run_dir.join("state");

    let mut backend = build_backend(
        &cfg,
        run,
        Arc::new(SimulatedExecutor::new(std::time::Duration::ZERO)),
        Arc::new(runner.clone()) as Arc<dyn CommandRunner>,
    )
    .unwrap();

    let plan = Arc::new(plan(
        2,
        vec![
            TaskBuilder::new("schema"),
            TaskBuilder::new("api").after("schema"),
            TaskBuilder::new("bad_ui"),
            TaskBuilder::new("docs").after("bad_ui"),
        ],
    ));
    backend.initialize().await.unwrap();
    backend.submit(plan).await.unwrap();
    let outcome = with_timeout(backend.wait_for_completion(2)).await.unwrap();
    backend.cleanup().await.unwrap();

    assert_eq!(outcome.status_of("schema"), Some(TaskStatus::Completed));
    assert_eq!(outcome.status_of("api"), Some(TaskStatus::Completed));
    assert_eq!(outcome.status_of("bad_ui"), Some(TaskStatus::Failed));
    assert_eq!(outcome.status_of("docs"), Some(TaskStatus::Blocked));

    let failed = outcome.result_for("bad_ui").unwrap();
    assert_eq!(failed.retry.attempts, 3);
    let error = failed.error.as_deref().unwrap();
    assert!(error.contains("worker raised boom"), "{error}");
    assert!(error.contains("Traceback"), "{error}");

    let runs: Vec<_> = runner
        .calls()
        .into_iter()
        .filter(|c| c.args.first().map(String::as_str) == Some("run"))
        .collect();
    // schema, api and three attempts of bad_ui.
    assert_eq!(runs.len(), 5);
    let first = &runs[0].args;
    assert!(first.contains(&format!("{}:/state", state_dir.display())));
    assert!(first.contains(&"taskfleet:latest".to_string()));
    assert_eq!(flag_value(first, "--state"), Some("/state"));
    assert_eq!(flag_value(first, "--output-dir"), Some("/outputs"));

    // Every finished container is removed during cleanup.
    let removed = runner
        .call_lines()
        .into_iter()
        .filter(|l| l.starts_with("docker rm -f"))
        .count();
    assert_eq!(removed, 5);
    assert!(state_dir.join("jobs.json").is_file());
}

#[tokio::test]
async fn missing_image_fails_initialization() {
    init_tracing();
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner
        .respond("docker", "version", success("27.1.0\n"))
        .respond("docker", "image", failure(1, "Error: No such image: taskfleet:latest"));
    let cfg = ConfigBuilder::new(dir.path()).backend(BackendKind::Docker).build();

    let mut backend = build_backend(
        &cfg,
        docker_run(dir.path()),
        Arc::new(SimulatedExecutor::new(std::time::Duration::ZERO)),
        Arc::new(runner),
    )
    .unwrap();
    let err = backend.initialize().await.unwrap_err();
    assert!(matches!(err, TaskfleetError::Initialization(ref m) if m.contains("taskfleet:latest")), "{err}");
    backend.cleanup().await.unwrap();
}

#[tokio::test]
async fn missing_binary_fails_initialization() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner.without("docker");
    let cfg = ConfigBuilder::new(dir.path()).backend(BackendKind::Docker).build();

    let mut backend = build_backend(
        &cfg,
        docker_run(dir.path()),
        Arc::new(SimulatedExecutor::new(std::time::Duration::ZERO)),
        Arc::new(runner.clone()),
    )
    .unwrap();
    assert!(matches!(backend.initialize().await, Err(TaskfleetError::Initialization(_))));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn network_is_created_when_missing() {
    let dir = tempdir().unwrap();
    let runner = ScriptedRunner::new();
    runner
        .respond("docker", "version", success("27.1.0\n"))
        .handle(|spec| {
            (spec.args.first().map(String::as_str) == Some("network")
                && spec.args.get(1).map(String::as_str) == Some("inspect"))
            .then(|| failure(1, "Error: No such network: fleet"))
        })
        .respond("docker", "network", success("net-id\n"))
        .respond("docker", "image", success("[]"));

    let cfg = ConfigBuilder::new(dir.path())
        .backend(BackendKind::Docker)
        .docker_network("fleet")
        .build();

    let mut backend = build_backend(
        &cfg,
        docker_run(dir.path()),
        Arc::new(SimulatedExecutor::new(std::time::Duration::ZERO)),
        Arc::new(runner.clone()),
    )
    .unwrap();
    backend.initialize().await.unwrap();
    assert!(runner.call_lines().contains(&"docker network create fleet".to_string()));
}
