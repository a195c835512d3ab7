// src/backend/mod.rs

//! Execution backends.
//!
//! Every backend implements [`ExecutionBackend`] by pairing the shared
//! scheduling loop in [`pooled`] with a substrate-specific worker pool:
//!
//! - [`threading`]: tokio tasks in this process, state in memory.
//! - [`container`]: one Docker container per attempt, state on a mounted
//!   directory.
//! - [`slurm`] and [`batch`]: cluster jobs polled through their queue's CLI,
//!   state on a shared directory or in object storage; both go through the
//!   generic job pool in [`jobs`].
//!
//! The variant is picked once from configuration by [`build_backend`].

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::model::ConfigFile;
use crate::errors::Result;
use crate::exec::command::CommandRunner;
use crate::exec::executor::{ExecutorSpec, TaskExecutor};
use crate::plan::model::ExecutionPlan;
use crate::sched::{ExponentialBackoff, RetryPolicy, RunOutcome};
use crate::store::{FileStore, MemoryStore, ObjectStore, ObjectStoreSettings, StateStore};
use crate::types::{BackendKind, BoxFuture};

pub mod batch;
pub mod container;
pub mod jobs;
pub mod pooled;
pub mod slurm;
pub mod threading;

pub use jobs::{JobPool, JobQueue, JobRequest, JobState};
pub use pooled::{PooledBackend, WorkerPool};
pub use threading::ThreadPool;

/// Where and how tasks of one run execute.
///
/// Lifecycle: `initialize` → `submit` → `wait_for_completion` → `cleanup`.
/// An instance runs exactly one plan and is not reusable after `cleanup`.
pub trait ExecutionBackend: Send + Debug {
    fn name(&self) -> &'static str;

    /// Prepare state storage and check prerequisites. Idempotent.
    fn initialize(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Register the plan. Does not start execution; a second call fails with
    /// a submission error.
    fn submit(&mut self, plan: Arc<ExecutionPlan>) -> BoxFuture<'_, Result<()>>;

    /// Run the scheduling loop until every task is terminal or a fatal error
    /// occurs. At most `min(max_workers, plan budget)` tasks run at once.
    fn wait_for_completion(&mut self, max_workers: usize) -> BoxFuture<'_, Result<RunOutcome>>;

    /// Stop in-flight workers and release resources. Safe to call at any
    /// time, any number of times.
    fn cleanup(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Token that interrupts `wait_for_completion` when cancelled.
    fn cancel_token(&self) -> CancellationToken;
}

/// Knobs of the scheduling loop.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub max_retries: u32,
    /// How often out-of-process pools ask their substrate for job status.
    pub poll_interval: Duration,
    /// Overall limit for `wait_for_completion`.
    pub timeout: Option<Duration>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            retry_policy: Arc::new(ExponentialBackoff::default()),
            max_retries: 3,
            poll_interval: Duration::from_secs(5),
            timeout: None,
        }
    }
}

impl BackendOptions {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let policy = ExponentialBackoff::new(cfg.retry.base_delay, cfg.retry.multiplier)
            .with_max_delay(cfg.retry.max_delay);
        Self {
            retry_policy: Arc::new(policy),
            max_retries: cfg.retry.max_retries,
            poll_interval: cfg.orchestrator.poll_interval,
            timeout: cfg.orchestrator.timeout,
        }
    }
}

/// Identity of the run a backend executes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_id: String,
    pub requirements: String,
    /// Local directory holding this run's plan, summary and artifacts.
    pub run_dir: PathBuf,
    /// Executor that out-of-process workers should build.
    pub executor: ExecutorSpec,
}

impl RunContext {
    /// Directory under which each task writes its artifacts.
    pub fn tasks_dir(&self) -> PathBuf {
        self.run_dir.join("tasks")
    }

    /// Short job-name prefix: first eight characters of the run id suffix.
    pub fn short_id(&self) -> String {
        let tail = self.run_id.rsplit('_').next().unwrap_or(&self.run_id);
        tail.chars().take(8).collect()
    }
}

/// Construct the backend selected in `cfg`.
///
/// `executor` is used by the in-process backend; out-of-process workers build
/// theirs from [`RunContext::executor`].
pub fn build_backend(
    cfg: &ConfigFile,
    run: RunContext,
    executor: Arc<dyn TaskExecutor>,
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn ExecutionBackend>> {
    let options = BackendOptions::from_config(cfg);
    let kind = cfg.orchestrator.backend;
    info!(backend = %kind, run_id = %run.run_id, "building backend");

    let backend: Box<dyn ExecutionBackend> = match kind {
        BackendKind::Threading => {
            let pool = ThreadPool::new(executor, &run);
            let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
            Box::new(PooledBackend::new(kind.as_str(), pool, store, run, options))
        }
        BackendKind::Docker => {
            let state_dir = run.run_dir.join("state");
            let queue = container::DockerQueue::new(
                cfg.docker.clone(),
                Arc::clone(&runner),
                state_dir.clone(),
                run.tasks_dir(),
                run.run_id.clone(),
            );
            let store: Arc<dyn StateStore> = Arc::new(FileStore::new(state_dir));
            let pool = JobPool::new(
                queue,
                Arc::clone(&store),
                container::CONTAINER_STATE_DIR.to_string(),
                Some(container::CONTAINER_OUTPUT_DIR.to_string()),
                &run,
                options.poll_interval,
            );
            Box::new(PooledBackend::new(kind.as_str(), pool, store, run, options))
        }
        BackendKind::Slurm => {
            let base = cfg
                .slurm
                .shared_dir
                .clone()
                .unwrap_or_else(|| cfg.orchestrator.output_dir.clone())
                .join(&run.run_id);
            let state_dir = base.join("state");
            let queue = slurm::SlurmQueue::new(cfg.slurm.clone(), Arc::clone(&runner), base.join("jobs"));
            let store: Arc<dyn StateStore> = Arc::new(FileStore::new(state_dir.clone()));
            let pool = JobPool::new(
                queue,
                Arc::clone(&store),
                state_dir.display().to_string(),
                Some(base.join("tasks").display().to_string()),
                &run,
                options.poll_interval,
            );
            Box::new(PooledBackend::new(kind.as_str(), pool, store, run, options))
        }
        BackendKind::ParallelCluster => {
            let settings = object_settings(cfg, &run);
            let store: Arc<dyn StateStore> =
                Arc::new(ObjectStore::new(settings.clone(), Arc::clone(&runner)));
            let queue = slurm::SlurmQueue::new(cfg.slurm.clone(), Arc::clone(&runner), run.run_dir.join("jobs"));
            let pool = JobPool::new(
                queue,
                Arc::clone(&store),
                settings.url("").trim_end_matches('/').to_string(),
                None,
                &run,
                options.poll_interval,
            );
            Box::new(PooledBackend::new(kind.as_str(), pool, store, run, options))
        }
        BackendKind::Batch => {
            let settings = object_settings(cfg, &run);
            let store: Arc<dyn StateStore> =
                Arc::new(ObjectStore::new(settings.clone(), Arc::clone(&runner)));
            let queue = batch::BatchQueue::new(
                cfg.batch.clone(),
                Some(cfg.cloud.region.clone()),
                Arc::clone(&runner),
            );
            let pool = JobPool::new(
                queue,
                Arc::clone(&store),
                settings.url("").trim_end_matches('/').to_string(),
                None,
                &run,
                options.poll_interval,
            );
            Box::new(PooledBackend::new(kind.as_str(), pool, store, run, options))
        }
    };

    Ok(backend)
}

fn object_settings(cfg: &ConfigFile, run: &RunContext) -> ObjectStoreSettings {
    let prefix = cfg.cloud.prefix.trim_matches('/');
    ObjectStoreSettings {
        bucket: cfg.cloud.bucket.clone().unwrap_or_default(),
        prefix: if prefix.is_empty() {
            run.run_id.clone()
        } else {
            format!("{prefix}/{}", run.run_id)
        },
        region: Some(cfg.cloud.region.clone()),
    }
}
