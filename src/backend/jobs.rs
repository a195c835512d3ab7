// src/backend/jobs.rs

//! Worker pool for substrates that run each attempt as an external job
//! (containers, SLURM jobs, AWS Batch jobs) and can only be polled.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::RunContext;
use crate::backend::pooled::{WorkerPool, poll_pause};
use crate::errors::Result;
use crate::plan::task::TaskId;
use crate::sched::{AttemptOutcome, AttemptReport, Dispatch};
use crate::store::{self, StateStore, WorkerReport, keys};
use crate::types::BoxFuture;

/// Consecutive polls a job may go unseen before it is declared lost.
pub const MAX_UNKNOWN_POLLS: u32 = 20;

/// State of an external job as reported by its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Accepted but waiting in the substrate's own queue.
    Queued,
    Running,
    Succeeded,
    Failed(String),
    /// Not visible right now (accounting lag, eventual consistency).
    Unknown,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }
}

/// What to start for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    /// Job name shown by the substrate.
    pub name: String,
    /// Arguments after the worker program, starting with `worker`.
    pub worker_args: Vec<String>,
}

impl JobRequest {
    fn new(run: &RunContext, dispatch: &Dispatch, state_arg: &str, output_arg: Option<&str>) -> Self {
        let mut worker_args = vec![
            "worker".to_string(),
            "--state".to_string(),
            state_arg.to_string(),
            "--task".to_string(),
            dispatch.task.id.clone(),
            "--attempt".to_string(),
            dispatch.attempt.to_string(),
        ];
        if let Some(out) = output_arg {
            worker_args.push("--output-dir".to_string());
            worker_args.push(out.to_string());
        }

        Self {
            task_id: dispatch.task.id.clone(),
            attempt: dispatch.attempt,
            name: job_name(&run.short_id(), &dispatch.task.id, dispatch.attempt),
            worker_args,
        }
    }

    /// Worker arguments without the leading `worker` subcommand, for
    /// substrates whose configured worker command already names it.
    pub fn flags(&self) -> &[String] {
        self.worker_args.get(1..).unwrap_or_default()
    }
}

/// `tf-<run>-<task>-a<n>`, restricted to characters every substrate accepts.
pub fn job_name(run: &str, task: &str, attempt: u32) -> String {
    let raw = format!("tf-{run}-{task}-a{attempt}");
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .take(128)
        .collect()
}

/// Submission and status interface of an external job system.
pub trait JobQueue: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Verify the job system is usable; failures are initialization errors.
    fn check_available(&self) -> BoxFuture<'_, Result<()>>;

    /// Submit one job and return its id.
    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<String>>;

    /// Current state of each listed job. Ids missing from the map are
    /// treated as [`JobState::Unknown`].
    fn query<'a>(&'a self, job_ids: &'a [String]) -> BoxFuture<'a, Result<HashMap<String, JobState>>>;

    /// Extra diagnostics for a failed job (log tail), if available.
    fn failure_detail<'a>(&'a self, _job_id: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async { None })
    }

    /// Release resources of a finished job.
    fn release<'a>(&'a self, _job_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Stop a job that is still queued or running.
    fn cancel<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Map an artifact path reported by a worker to a path on this host.
    fn host_path(&self, reported: &str) -> PathBuf {
        PathBuf::from(reported)
    }
}

#[derive(Debug, Clone)]
struct ActiveJob {
    job_id: String,
    task_id: TaskId,
    attempt: u32,
    started: Instant,
    unknown_polls: u32,
}

/// [`WorkerPool`] over any [`JobQueue`].
///
/// Workers write their outcome to `reports/<task>.attempt-<n>.json` in the
/// shared store; the pool polls the queue and, once a job has finished,
/// combines the queue's verdict with that report.
#[derive(Debug)]
pub struct JobPool<Q: JobQueue> {
    queue: Q,
    store: Arc<dyn StateStore>,
    run: RunContext,
    /// State location as seen by the worker.
    state_arg: String,
    /// Artifact directory as seen by the worker, if it shares one with us.
    output_arg: Option<String>,
    poll_interval: Duration,
    active: Vec<ActiveJob>,
    finished: VecDeque<AttemptReport>,
    /// Finished jobs whose resources are released at shutdown.
    done_jobs: Vec<String>,
}

impl<Q: JobQueue> JobPool<Q> {
    pub fn new(
        queue: Q,
        store: Arc<dyn StateStore>,
        state_arg: String,
        output_arg: Option<String>,
        run: &RunContext,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            run: run.clone(),
            state_arg,
            output_arg,
            poll_interval,
            active: Vec::new(),
            finished: VecDeque::new(),
            done_jobs: Vec::new(),
        }
    }

    pub fn active_jobs(&self) -> Vec<String> {
        self.active.iter().map(|j| j.job_id.clone()).collect()
    }

    /// Query the queue once and move every finished job to `finished`.
    async fn poll_once(&mut self) -> Result<()> {
        let ids = self.active_jobs();
        let states = self.queue.query(&ids).await?;

        let mut i = 0;
        while i < self.active.len() {
            let job = &mut self.active[i];
            let state = states.get(&job.job_id).cloned().unwrap_or(JobState::Unknown);

            let verdict = match state {
                JobState::Succeeded => Some(None),
                JobState::Failed(reason) => Some(Some(reason)),
                JobState::Unknown => {
                    job.unknown_polls += 1;
                    if job.unknown_polls >= MAX_UNKNOWN_POLLS {
                        Some(Some(format!(
                            "job {} disappeared from {} after {} polls",
                            job.job_id,
                            self.queue.name(),
                            job.unknown_polls
                        )))
                    } else {
                        None
                    }
                }
                JobState::Queued | JobState::Running => {
                    job.unknown_polls = 0;
                    None
                }
            };

            let Some(failure) = verdict else {
                i += 1;
                continue;
            };

            let job = self.active[i].clone();
            let report = self.collect(&job, failure).await;
            // Only forget the job once everything for it has been awaited.
            self.active.remove(i);
            self.done_jobs.push(job.job_id);
            self.finished.push_back(report);
        }
        Ok(())
    }

    /// Build the attempt report for a finished job.
    async fn collect(&self, job: &ActiveJob, queue_failure: Option<String>) -> AttemptReport {
        let key = keys::report(&job.task_id, job.attempt);
        let worker_report: Option<WorkerReport> = match store::read_json(self.store.as_ref(), &key).await {
            Ok(r) => r,
            Err(e) => {
                warn!(task = %job.task_id, job = %job.job_id, error = %e, "unreadable worker report");
                None
            }
        };

        let outcome = match (queue_failure, worker_report) {
            (None, Some(r)) if r.success => AttemptOutcome::Succeeded {
                artifacts: r.artifacts.iter().map(|a| self.queue.host_path(a)).collect(),
            },
            (None, Some(r)) => AttemptOutcome::Failed {
                error: r.error.unwrap_or_else(|| "worker reported failure".to_string()),
            },
            (None, None) => AttemptOutcome::Failed {
                error: format!("job {} finished without writing a report", job.job_id),
            },
            (Some(reason), report) => {
                let mut error = report
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| format!("job {} failed: {reason}", job.job_id));
                if let Some(detail) = self.queue.failure_detail(&job.job_id).await {
                    error.push_str("\n--- job output ---\n");
                    error.push_str(&detail);
                }
                AttemptOutcome::Failed { error }
            }
        };

        debug!(task = %job.task_id, job = %job.job_id, "job finished");
        AttemptReport {
            task_id: job.task_id.clone(),
            attempt: job.attempt,
            worker: job.job_id.clone(),
            duration: job.started.elapsed(),
            outcome,
        }
    }
}

impl<Q: JobQueue> WorkerPool for JobPool<Q> {
    fn prepare(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.queue.check_available().await?;
            info!(queue = self.queue.name(), state = %self.state_arg, "job queue available");
            Ok(())
        })
    }

    fn dispatch(&mut self, dispatch: Dispatch) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let request = JobRequest::new(&self.run, &dispatch, &self.state_arg, self.output_arg.as_deref());
            let job_id = self.queue.submit(&request).await?;

            info!(
                queue = self.queue.name(),
                task = %request.task_id,
                attempt = request.attempt,
                job = %job_id,
                "job submitted"
            );

            self.active.push(ActiveJob {
                job_id: job_id.clone(),
                task_id: request.task_id,
                attempt: request.attempt,
                started: Instant::now(),
                unknown_polls: 0,
            });
            Ok(job_id)
        })
    }

    fn next_completion(&mut self) -> BoxFuture<'_, Result<AttemptReport>> {
        Box::pin(async move {
            loop {
                if let Some(report) = self.finished.pop_front() {
                    return Ok(report);
                }
                if self.active.is_empty() {
                    std::future::pending::<()>().await;
                }
                self.poll_once().await?;
                if self.finished.is_empty() {
                    poll_pause(self.poll_interval).await;
                }
            }
        })
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for job in self.active.drain(..) {
                match self.queue.cancel(&job.job_id).await {
                    Ok(()) => info!(job = %job.job_id, task = %job.task_id, "job cancelled"),
                    Err(e) => warn!(job = %job.job_id, error = %e, "failed to cancel job"),
                }
            }
            for job_id in self.done_jobs.drain(..) {
                if let Err(e) = self.queue.release(&job_id).await {
                    warn!(job = %job_id, error = %e, "failed to release finished job");
                }
            }
            self.finished.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_sanitised() {
        assert_eq!(job_name("1a2b3c4d", "task_1", 2), "tf-1a2b3c4d-task_1-a2");
        assert_eq!(job_name("r", "api/v1 svc", 1), "tf-r-api-v1-svc-a1");
    }
}
