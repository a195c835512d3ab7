// src/backend/batch.rs

//! AWS Batch job queue driven through the `aws batch` CLI.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::backend::jobs::{JobQueue, JobRequest, JobState};
use crate::config::model::BatchConfig;
use crate::errors::{Result, TaskfleetError};
use crate::exec::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::types::BoxFuture;

/// `describe-jobs` accepts at most this many ids per call.
const DESCRIBE_CHUNK: usize = 100;

#[derive(Debug, Clone)]
pub struct BatchQueue {
    cfg: BatchConfig,
    region: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    #[serde(default)]
    jobs: Vec<JobDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobDetail {
    job_id: String,
    status: String,
    #[serde(default)]
    status_reason: Option<String>,
}

impl BatchQueue {
    pub fn new(cfg: BatchConfig, region: Option<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cfg, region, runner }
    }

    fn aws(&self) -> CommandSpec {
        let spec = CommandSpec::new("aws");
        let spec = match &self.region {
            Some(region) => spec.args(["--region", region.as_str()]),
            None => spec,
        };
        spec.args(["--output", "json", "batch"])
    }

    fn job_queue(&self) -> Result<&str> {
        self.cfg
            .job_queue
            .as_deref()
            .ok_or_else(|| TaskfleetError::ConfigError("[batch].job_queue is required".to_string()))
    }

    fn job_definition(&self) -> Result<&str> {
        self.cfg.job_definition.as_deref().ok_or_else(|| {
            TaskfleetError::ConfigError("[batch].job_definition is required".to_string())
        })
    }

    /// `--container-overrides` document for one attempt.
    pub fn container_overrides(&self, request: &JobRequest) -> serde_json::Value {
        let mut command = vec!["taskfleet".to_string()];
        command.extend(request.worker_args.iter().cloned());
        json!({
            "command": command,
            "resourceRequirements": [
                { "type": "VCPU", "value": self.cfg.vcpus.to_string() },
                { "type": "MEMORY", "value": self.cfg.memory_mb.to_string() },
            ],
        })
    }

    async fn checked(&self, spec: CommandSpec, what: &str) -> Result<CommandOutput> {
        let out = self.runner.run(spec).await?;
        if !out.success() {
            return Err(TaskfleetError::Backend(format!(
                "{what} failed: {}",
                out.diagnostic()
            )));
        }
        Ok(out)
    }
}

/// Map an AWS Batch job status to a [`JobState`].
pub fn map_status(status: &str, reason: Option<&str>) -> JobState {
    match status {
        "SUBMITTED" | "PENDING" | "RUNNABLE" | "STARTING" => JobState::Queued,
        "RUNNING" => JobState::Running,
        "SUCCEEDED" => JobState::Succeeded,
        "FAILED" => JobState::Failed(reason.unwrap_or("batch job failed").to_string()),
        _ => JobState::Unknown,
    }
}

impl JobQueue for BatchQueue {
    fn name(&self) -> &'static str {
        "batch"
    }

    fn check_available(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.runner.locate("aws") {
                return Err(TaskfleetError::Initialization(
                    "aws CLI not found on PATH".to_string(),
                ));
            }
            let queue = self
                .job_queue()
                .map_err(|e| TaskfleetError::Initialization(e.to_string()))?;
            self.job_definition()
                .map_err(|e| TaskfleetError::Initialization(e.to_string()))?;

            let spec = self.aws().args(["describe-job-queues", "--job-queues", queue]);
            let out = self
                .checked(spec, "describing job queue")
                .await
                .map_err(|e| TaskfleetError::Initialization(e.to_string()))?;
            if !out.stdout.contains(queue) {
                return Err(TaskfleetError::Initialization(format!(
                    "AWS Batch job queue '{queue}' does not exist"
                )));
            }
            debug!(queue, "batch job queue available");
            Ok(())
        })
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let overrides = self.container_overrides(request).to_string();
            let timeout = format!("attemptDurationSeconds={}", self.cfg.timeout_secs);
            let spec = self.aws().args([
                "submit-job",
                "--job-name",
                request.name.as_str(),
                "--job-queue",
                self.job_queue()?,
                "--job-definition",
                self.job_definition()?,
                "--container-overrides",
                overrides.as_str(),
                "--timeout",
                timeout.as_str(),
            ]);
            let out = self.checked(spec, "submitting batch job").await?;
            let parsed: SubmitResponse = serde_json::from_str(&out.stdout)?;
            Ok(parsed.job_id)
        })
    }

    fn query<'a>(&'a self, job_ids: &'a [String]) -> BoxFuture<'a, Result<HashMap<String, JobState>>> {
        Box::pin(async move {
            let mut states = HashMap::new();
            for chunk in job_ids.chunks(DESCRIBE_CHUNK) {
                let spec = self
                    .aws()
                    .arg("describe-jobs")
                    .arg("--jobs")
                    .args(chunk.iter().cloned());
                let out = self.checked(spec, "describing batch jobs").await?;
                let parsed: DescribeResponse = serde_json::from_str(&out.stdout)?;
                for job in parsed.jobs {
                    let state = map_status(&job.status, job.status_reason.as_deref());
                    states.insert(job.job_id, state);
                }
            }
            Ok(states)
        })
    }

    fn cancel<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let spec = self.aws().args([
                "terminate-job",
                "--job-id",
                job_id,
                "--reason",
                "cancelled by taskfleet",
            ]);
            self.checked(spec, "terminating batch job").await?;
            Ok(())
        })
    }
}
