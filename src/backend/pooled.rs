// src/backend/pooled.rs

//! The scheduling loop shared by every backend.
//!
//! [`PooledBackend`] owns the [`Scheduler`] and a [`WorkerPool`]. The pool
//! knows how to start one task attempt on its substrate and how to notice
//! that an attempt has finished; everything else (ready-set ordering, the
//! concurrency limit, retries, blocking, persistence) happens here, once.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendOptions, ExecutionBackend, RunContext};
use crate::errors::{Result, TaskfleetError};
use crate::plan::model::ExecutionPlan;
use crate::plan::task::TaskStatus;
use crate::sched::{AttemptOutcome, AttemptReport, Dispatch, RunOutcome, Scheduler, SchedulerStep};
use crate::store::{self, JobPhase, JobRecord, StateStore, TaskDefinition, keys};
use crate::types::BoxFuture;

/// Substrate-specific half of a backend.
pub trait WorkerPool: Send + Sync + Debug {
    /// Check prerequisites (binaries, daemons, queues) and prepare resources.
    ///
    /// Failures should be [`TaskfleetError::Initialization`].
    fn prepare(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Start one attempt; returns the worker handle (thread slot, container
    /// id, job id).
    fn dispatch(&mut self, dispatch: Dispatch) -> BoxFuture<'_, Result<String>>;

    /// Wait until some dispatched attempt finishes.
    ///
    /// Must be cancel-safe: the driver polls it inside `select!`, and a
    /// dropped call must not lose a finished attempt.
    fn next_completion(&mut self) -> BoxFuture<'_, Result<AttemptReport>>;

    /// Stop every in-flight attempt and release resources. Idempotent.
    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>>;
}

#[derive(Debug)]
enum Lifecycle {
    Created,
    Initialized,
    Submitted(Arc<ExecutionPlan>),
    Finished,
    CleanedUp,
}

/// [`ExecutionBackend`] built from a worker pool and a state store.
#[derive(Debug)]
pub struct PooledBackend<P: WorkerPool> {
    name: &'static str,
    pool: P,
    store: Arc<dyn StateStore>,
    run: RunContext,
    options: BackendOptions,
    state: Lifecycle,
    cancel: CancellationToken,
}

impl<P: WorkerPool> PooledBackend<P> {
    pub fn new(
        name: &'static str,
        pool: P,
        store: Arc<dyn StateStore>,
        run: RunContext,
        options: BackendOptions,
    ) -> Self {
        Self {
            name,
            pool,
            store,
            run,
            options,
            state: Lifecycle::Created,
            cancel: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn do_initialize(&mut self) -> Result<()> {
        match self.state {
            Lifecycle::Created => {}
            Lifecycle::CleanedUp => {
                return Err(TaskfleetError::Initialization(format!(
                    "{} backend was already cleaned up and cannot be reused",
                    self.name
                )));
            }
            _ => {
                debug!(backend = self.name, "initialize called again; nothing to do");
                return Ok(());
            }
        }

        self.store.ensure_ready().await.map_err(as_init_error)?;
        self.pool.prepare().await.map_err(as_init_error)?;
        self.state = Lifecycle::Initialized;

        info!(
            backend = self.name,
            run_id = %self.run.run_id,
            store = %self.store.describe(),
            "backend initialised"
        );
        Ok(())
    }

    async fn do_submit(&mut self, plan: Arc<ExecutionPlan>) -> Result<()> {
        match self.state {
            Lifecycle::Initialized => {}
            Lifecycle::Created => {
                return Err(TaskfleetError::Submission(format!(
                    "{} backend must be initialised before submit",
                    self.name
                )));
            }
            Lifecycle::Submitted(_) | Lifecycle::Finished => {
                return Err(TaskfleetError::Submission(format!(
                    "a plan was already submitted to this {} backend",
                    self.name
                )));
            }
            Lifecycle::CleanedUp => {
                return Err(TaskfleetError::Submission(format!(
                    "{} backend was cleaned up",
                    self.name
                )));
            }
        }

        for task in plan.tasks() {
            let definition = TaskDefinition {
                run_id: self.run.run_id.clone(),
                requirements: plan.requirements().to_string(),
                task: task.clone(),
                executor: self.run.executor.clone(),
            };
            store::write_json(self.store.as_ref(), &keys::task_definition(&task.id), &definition)
                .await
                .map_err(|e| TaskfleetError::Submission(format!("storing task '{}': {e}", task.id)))?;
        }

        info!(
            backend = self.name,
            tasks = plan.len(),
            budget = plan.budget(),
            "plan submitted"
        );
        self.state = Lifecycle::Submitted(plan);
        Ok(())
    }

    async fn do_wait(&mut self, max_workers: usize) -> Result<RunOutcome> {
        let plan = match std::mem::replace(&mut self.state, Lifecycle::Finished) {
            Lifecycle::Submitted(plan) => plan,
            other => {
                let msg = match other {
                    Lifecycle::Finished => "wait_for_completion was already called",
                    Lifecycle::CleanedUp => "backend was cleaned up",
                    _ => "no plan was submitted",
                };
                self.state = other;
                return Err(TaskfleetError::Submission(format!("{}: {msg}", self.name)));
            }
        };

        let workers = max_workers.min(plan.budget()).max(1);
        let scheduler = Scheduler::new(
            Arc::clone(&plan),
            workers,
            Arc::clone(&self.options.retry_policy),
            self.options.max_retries,
        );

        info!(
            backend = self.name,
            run_id = %self.run.run_id,
            workers,
            tasks = plan.len(),
            "starting scheduling loop"
        );

        let mut driver = Driver {
            name: self.name,
            pool: &mut self.pool,
            store: self.store.as_ref(),
            scheduler,
            cancel: self.cancel.clone(),
            deadline: self.options.timeout.map(|t| Instant::now() + t),
        };
        driver.run().await?;

        let outcome = driver.scheduler.into_outcome();
        info!(
            backend = self.name,
            completed = outcome.statuses.iter().filter(|s| s.status == TaskStatus::Completed).count(),
            failed = outcome.statuses.iter().filter(|s| s.status == TaskStatus::Failed).count(),
            blocked = outcome.blocked.len(),
            "scheduling loop finished"
        );
        Ok(outcome)
    }

    async fn do_cleanup(&mut self) -> Result<()> {
        if matches!(self.state, Lifecycle::CleanedUp) {
            debug!(backend = self.name, "cleanup already done");
            return Ok(());
        }
        self.state = Lifecycle::CleanedUp;
        self.cancel.cancel();
        self.pool.shutdown().await?;
        info!(backend = self.name, "backend cleaned up");
        Ok(())
    }
}

fn as_init_error(e: TaskfleetError) -> TaskfleetError {
    match e {
        TaskfleetError::Initialization(_) => e,
        other => TaskfleetError::Initialization(other.to_string()),
    }
}

impl<P: WorkerPool> ExecutionBackend for PooledBackend<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn initialize(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.do_initialize())
    }

    fn submit(&mut self, plan: Arc<ExecutionPlan>) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.do_submit(plan))
    }

    fn wait_for_completion(&mut self, max_workers: usize) -> BoxFuture<'_, Result<RunOutcome>> {
        Box::pin(self.do_wait(max_workers))
    }

    fn cleanup(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.do_cleanup())
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One execution of the scheduling loop.
struct Driver<'a, P: WorkerPool> {
    name: &'static str,
    pool: &'a mut P,
    store: &'a dyn StateStore,
    scheduler: Scheduler,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

enum Wake {
    Report(Result<AttemptReport>),
    RetryDue,
    Cancelled,
    TimedOut,
}

impl<P: WorkerPool> Driver<'_, P> {
    async fn run(&mut self) -> Result<()> {
        self.persist_statuses().await;

        loop {
            self.scheduler.release_due_retries(Instant::now());
            self.dispatch_ready().await?;
            self.persist_statuses().await;

            if self.scheduler.is_finished() {
                return Ok(());
            }
            self.scheduler.check_progress()?;

            let retry_due = self.scheduler.next_retry_due();
            let waiting_on_workers = self.scheduler.running_count() > 0;

            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = sleep_until_opt(self.deadline) => Wake::TimedOut,
                _ = sleep_until_opt(retry_due) => Wake::RetryDue,
                report = self.pool.next_completion(), if waiting_on_workers => Wake::Report(report),
            };

            match wake {
                Wake::Cancelled => {
                    warn!(backend = self.name, "run cancelled");
                    return Err(TaskfleetError::Cancelled);
                }
                Wake::TimedOut => {
                    warn!(backend = self.name, "run timed out");
                    return Err(TaskfleetError::Backend(format!(
                        "{} backend timed out with {} task(s) still running",
                        self.name,
                        self.scheduler.running_count()
                    )));
                }
                Wake::RetryDue => {}
                Wake::Report(report) => {
                    let report = report?;
                    self.record_finish(&report).await;
                    let task_id = report.task_id.clone();
                    let step = self.scheduler.apply(report, Instant::now())?;
                    self.persist_step(&task_id, &step).await?;
                }
            }
        }
    }

    async fn dispatch_ready(&mut self) -> Result<()> {
        while let Some(dispatch) = self.scheduler.next_dispatch()? {
            let task_id = dispatch.task.id.clone();
            let attempt = dispatch.attempt;

            match self.pool.dispatch(dispatch).await {
                Ok(handle) => {
                    debug!(task = %task_id, attempt, worker = %handle, "attempt started");
                    self.record_job(JobRecord::submitted(handle, task_id.as_str(), attempt))
                        .await;
                }
                Err(e) => {
                    warn!(task = %task_id, attempt, error = %e, "could not start attempt");
                    let step = self
                        .scheduler
                        .dispatch_failed(&task_id, e.to_string(), Instant::now())?;
                    self.persist_step(&task_id, &step).await?;
                }
            }
        }
        Ok(())
    }

    async fn record_finish(&self, report: &AttemptReport) {
        let phase = match report.outcome {
            AttemptOutcome::Succeeded { .. } => JobPhase::Succeeded,
            AttemptOutcome::Failed { .. } => JobPhase::Failed,
        };
        let record = JobRecord::submitted(report.worker.as_str(), report.task_id.as_str(), report.attempt)
            .with_phase(phase);
        self.record_job(record).await;
    }

    async fn record_job(&self, record: JobRecord) {
        if let Err(e) = store::upsert_job(self.store, record).await {
            warn!(backend = self.name, error = %e, "failed to update job table");
        }
    }

    /// Status table writes are best effort; results are not.
    async fn persist_statuses(&self) {
        let snapshot = self.scheduler.snapshot();
        if let Err(e) = store::write_json(self.store, keys::TASKS, &snapshot).await {
            warn!(backend = self.name, error = %e, "failed to persist task status table");
        }
    }

    async fn persist_step(&self, task_id: &str, step: &SchedulerStep) -> Result<()> {
        if !step.newly_ready.is_empty() {
            debug!(task = %task_id, ready = ?step.newly_ready, "dependents ready");
        }
        if !step.newly_blocked.is_empty() {
            warn!(task = %task_id, blocked = ?step.newly_blocked, "dependents blocked");
        }

        if let Some(result) = self.scheduler.result_of(task_id) {
            store::write_json(self.store, &keys::result(task_id), result).await?;
        }
        Ok(())
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

/// Polling cadence helper for pools that have to ask an external system.
pub(crate) async fn poll_pause(interval: Duration) {
    tokio::time::sleep(interval.max(Duration::from_millis(10))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::batch::BatchQueue;
    use crate::backend::container::DockerQueue;
    use crate::backend::jobs::JobPool;
    use crate::backend::slurm::SlurmQueue;
    use crate::backend::threading::ThreadPool;

    fn assert_backend<B: ExecutionBackend>() {}

    #[test]
    fn every_pool_yields_a_backend() {
        assert_backend::<PooledBackend<ThreadPool>>();
        assert_backend::<PooledBackend<JobPool<DockerQueue>>>();
        assert_backend::<PooledBackend<JobPool<SlurmQueue>>>();
        assert_backend::<PooledBackend<JobPool<BatchQueue>>>();
    }
}
