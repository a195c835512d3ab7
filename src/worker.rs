// src/worker.rs

//! `taskfleet worker`: runs one task attempt inside a container or cluster
//! job and reports back through the shared state store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli::WorkerArgs;
use crate::errors::{Result, TaskfleetError};
use crate::exec::command::CommandRunner;
use crate::exec::executor::ExecutionContext;
use crate::store::{self, JobPhase, JobRecord, StateLocation, StateStore, TaskDefinition, WorkerReport, keys};

/// Environment variables through which substrates expose the job id.
const JOB_ID_VARS: [&str; 3] = ["SLURM_JOB_ID", "AWS_BATCH_JOB_ID", "HOSTNAME"];

/// One worker invocation, independent of argument parsing.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub task_id: String,
    pub attempt: u32,
    /// Local artifact root; `None` means a scratch directory.
    pub output_dir: Option<PathBuf>,
    /// Copy artifacts into the store under `outputs/<task>/`.
    pub upload_artifacts: bool,
}

/// Entry point of the `worker` subcommand. Returns whether the attempt
/// succeeded.
pub async fn run_worker(args: &WorkerArgs, runner: Arc<dyn CommandRunner>) -> Result<bool> {
    let location = StateLocation::parse(&args.state, args.region.as_deref())?;
    let store = location.open(Arc::clone(&runner));

    let job = WorkerJob {
        task_id: args.task.clone(),
        attempt: args.attempt,
        output_dir: args.output_dir.clone(),
        upload_artifacts: matches!(location, StateLocation::Bucket(_)),
    };
    info!(task = %job.task_id, attempt = job.attempt, state = %location, "worker starting");

    let report = execute_attempt(store.as_ref(), &job, runner).await?;
    Ok(report.success)
}

/// Load the task definition, run it, and write the worker report.
///
/// Task failures are recorded in the report rather than returned; only
/// problems with the state store itself produce an `Err`.
pub async fn execute_attempt(
    store: &dyn StateStore,
    job: &WorkerJob,
    runner: Arc<dyn CommandRunner>,
) -> Result<WorkerReport> {
    let definition: TaskDefinition = store::read_json(store, &keys::task_definition(&job.task_id))
        .await?
        .ok_or_else(|| {
            TaskfleetError::Backend(format!(
                "no task definition for '{}' in {}",
                job.task_id,
                store.describe()
            ))
        })?;

    let job_id = job_id_from_env();
    let running = JobRecord::submitted(job_id.clone(), job.task_id.as_str(), job.attempt)
        .with_phase(JobPhase::Running);
    if let Err(e) = store::upsert_job(store, running).await {
        warn!(task = %job.task_id, error = %e, "could not mark job as running");
    }

    let output_dir = job.output_dir.clone().unwrap_or_else(scratch_dir);
    let ctx = ExecutionContext {
        run_id: definition.run_id.clone(),
        output_dir: output_dir.clone(),
        attempt: job.attempt,
        requirements: definition.requirements.clone(),
    };
    let executor = definition.executor.build(runner);

    let started = Instant::now();
    let result = executor.execute(&definition.task, &ctx).await;
    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (success, artifacts, error) = match result {
        Ok(output) => {
            let artifacts = if job.upload_artifacts {
                upload(store, &job.task_id, &ctx.task_dir(&definition.task), &output.artifacts).await?
            } else {
                output.artifacts.iter().map(|p| p.display().to_string()).collect()
            };
            (true, artifacts, None)
        }
        Err(e) => (false, Vec::new(), Some(e.to_string())),
    };

    let report = WorkerReport {
        task_id: job.task_id.clone(),
        attempt: job.attempt,
        success,
        artifacts,
        error,
        duration_ms,
        host: std::env::var("HOSTNAME").ok(),
        finished_at: Utc::now(),
    };
    store::write_json(store, &keys::report(&job.task_id, job.attempt), &report).await?;

    let phase = if success { JobPhase::Succeeded } else { JobPhase::Failed };
    let done = JobRecord::submitted(job_id, job.task_id.as_str(), job.attempt).with_phase(phase);
    if let Err(e) = store::upsert_job(store, done).await {
        warn!(task = %job.task_id, error = %e, "could not record job outcome");
    }

    info!(
        task = %job.task_id,
        attempt = job.attempt,
        success,
        duration_ms,
        "worker finished"
    );
    Ok(report)
}

/// Copy artifacts into the store and return their store URLs or keys.
async fn upload(
    store: &dyn StateStore,
    task_id: &str,
    task_dir: &Path,
    artifacts: &[PathBuf],
) -> Result<Vec<String>> {
    let mut keys_out = Vec::with_capacity(artifacts.len());
    for path in artifacts {
        let relative = path.strip_prefix(task_dir).unwrap_or(path);
        let relative = relative.to_string_lossy().trim_start_matches('/').to_string();
        let key = keys::output(task_id, &relative);

        let bytes = tokio::fs::read(path).await?;
        store.write(&key, bytes).await?;
        keys_out.push(key);
    }
    Ok(keys_out)
}

fn job_id_from_env() -> String {
    JOB_ID_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!("taskfleet-{}", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::command::ProcessRunner;
    use crate::exec::executor::ExecutorSpec;
    use crate::plan::task::Task;
    use crate::store::MemoryStore;

    async fn seed(store: &MemoryStore, task: &str) {
        let def = TaskDefinition {
            run_id: "run".into(),
            requirements: "build it".into(),
            task: Task::new(task, "do the thing"),
            executor: ExecutorSpec::Simulated { duration_ms: 1 },
        };
        store::write_json(store, &keys::task_definition(task), &def).await.unwrap();
    }

    #[tokio::test]
    async fn writes_report_and_job_rows() {
        let store = MemoryStore::new();
        seed(&store, "t1").await;
        let dir = tempfile::tempdir().unwrap();

        let job = WorkerJob {
            task_id: "t1".into(),
            attempt: 2,
            output_dir: Some(dir.path().to_path_buf()),
            upload_artifacts: false,
        };
        let report = execute_attempt(&store, &job, Arc::new(ProcessRunner)).await.unwrap();
        assert!(report.success);
        assert_eq!(report.attempt, 2);
        assert!(!report.artifacts.is_empty());

        let stored: WorkerReport = store::read_json(&store, &keys::report("t1", 2)).await.unwrap().unwrap();
        assert_eq!(stored, report);

        let jobs: Vec<JobRecord> = store::read_json(&store, keys::JOBS).await.unwrap().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].phase, JobPhase::Succeeded);
    }

    #[tokio::test]
    async fn uploads_artifacts_when_asked() {
        let store = MemoryStore::new();
        seed(&store, "t1").await;

        let job = WorkerJob {
            task_id: "t1".into(),
            attempt: 1,
            output_dir: None,
            upload_artifacts: true,
        };
        let report = execute_attempt(&store, &job, Arc::new(ProcessRunner)).await.unwrap();
        assert!(report.artifacts.iter().all(|k| k.starts_with("outputs/t1/")));
        assert!(store.keys().iter().any(|k| k.starts_with("outputs/t1/")));
    }

    #[tokio::test]
    async fn missing_definition_is_an_error() {
        let store = MemoryStore::new();
        let job = WorkerJob {
            task_id: "ghost".into(),
            attempt: 1,
            output_dir: None,
            upload_artifacts: false,
        };
        assert!(execute_attempt(&store, &job, Arc::new(ProcessRunner)).await.is_err());
    }
}
