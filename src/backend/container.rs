// src/backend/container.rs

//! Docker job queue: one detached container per task attempt.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::jobs::{JobQueue, JobRequest, JobState};
use crate::config::model::DockerConfig;
use crate::errors::{Result, TaskfleetError};
use crate::exec::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::types::BoxFuture;

/// Mount point of the run's state directory inside every container.
pub const CONTAINER_STATE_DIR: &str = "/state";
/// Mount point of the run's task output directory inside every container.
pub const CONTAINER_OUTPUT_DIR: &str = "/outputs";

const LOG_TAIL_LINES: &str = "50";

#[derive(Debug, Clone)]
pub struct DockerQueue {
    cfg: DockerConfig,
    runner: Arc<dyn CommandRunner>,
    host_state_dir: PathBuf,
    host_output_dir: PathBuf,
    run_id: String,
}

impl DockerQueue {
    pub fn new(
        cfg: DockerConfig,
        runner: Arc<dyn CommandRunner>,
        host_state_dir: PathBuf,
        host_output_dir: PathBuf,
        run_id: String,
    ) -> Self {
        Self {
            cfg,
            runner,
            host_state_dir,
            host_output_dir,
            run_id,
        }
    }

    fn docker(&self) -> CommandSpec {
        CommandSpec::new(self.cfg.binary.clone())
    }

    async fn checked(&self, spec: CommandSpec, what: &str) -> Result<CommandOutput> {
        let shown = spec.display();
        let out = self.runner.run(spec).await?;
        if !out.success() {
            return Err(TaskfleetError::Backend(format!(
                "{what} failed (`{shown}`): {}",
                out.diagnostic()
            )));
        }
        Ok(out)
    }

    /// Arguments of `docker run` for one attempt.
    pub fn run_args(&self, request: &JobRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            request.name.clone(),
            "--label".into(),
            format!("taskfleet.run={}", self.run_id),
            "--label".into(),
            format!("taskfleet.task={}", request.task_id),
        ];
        if let Some(network) = &self.cfg.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        args.push("-v".into());
        args.push(mount(&self.host_state_dir, CONTAINER_STATE_DIR));
        args.push("-v".into());
        args.push(mount(&self.host_output_dir, CONTAINER_OUTPUT_DIR));
        for var in &self.cfg.pass_env {
            // `-e NAME` forwards the value from our environment, if set.
            if std::env::var_os(var).is_some() {
                args.push("-e".into());
                args.push(var.clone());
            }
        }
        args.push(self.cfg.image.clone());
        args.extend(self.cfg.worker_command.iter().cloned());
        args.extend(request.flags().iter().cloned());
        args
    }

    async fn ensure_network(&self, network: &str) -> Result<()> {
        let inspect = self.docker().args(["network", "inspect", network]);
        let out = self.runner.run(inspect).await?;
        if out.success() {
            return Ok(());
        }
        info!(network, "creating docker network");
        let create = self.docker().args(["network", "create", network]);
        self.checked(create, "creating docker network")
            .await
            .map_err(|e| TaskfleetError::Initialization(e.to_string()))?;
        Ok(())
    }
}

fn mount(host: &Path, container: &str) -> String {
    format!("{}:{container}", host.display())
}

/// Parse `docker inspect -f '{{.State.Status}}|{{.State.ExitCode}}'` output.
pub fn parse_inspect(line: &str) -> JobState {
    let mut parts = line.trim().splitn(2, '|');
    let status = parts.next().unwrap_or_default();
    let code: i32 = parts.next().and_then(|c| c.trim().parse().ok()).unwrap_or(-1);

    match status {
        "created" | "restarting" => JobState::Queued,
        "running" | "paused" => JobState::Running,
        "exited" if code == 0 => JobState::Succeeded,
        "exited" => JobState::Failed(format!("container exited with code {code}")),
        "dead" => JobState::Failed("container is dead".to_string()),
        "removing" => JobState::Failed("container is being removed".to_string()),
        _ => JobState::Unknown,
    }
}

impl JobQueue for DockerQueue {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn check_available(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.runner.locate(&self.cfg.binary) {
                return Err(TaskfleetError::Initialization(format!(
                    "'{}' not found on PATH",
                    self.cfg.binary
                )));
            }

            let version = self
                .docker()
                .args(["version", "--format", "{{.Server.Version}}"]);
            let out = self
                .checked(version, "contacting the docker daemon")
                .await
                .map_err(|e| TaskfleetError::Initialization(e.to_string()))?;
            debug!(server = %out.stdout.trim(), "docker daemon reachable");

            let image = self
                .docker()
                .args(["image", "inspect", self.cfg.image.as_str()]);
            self.checked(image, "inspecting worker image")
                .await
                .map_err(|_| {
                    TaskfleetError::Initialization(format!(
                        "docker image '{}' not found; build or pull it first",
                        self.cfg.image
                    ))
                })?;

            if let Some(network) = &self.cfg.network {
                self.ensure_network(network).await?;
            }
            Ok(())
        })
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let spec = self.docker().args(self.run_args(request));
            let out = self.checked(spec, "starting container").await?;
            let id = out.stdout.trim();
            if id.is_empty() {
                return Err(TaskfleetError::Backend(
                    "docker run printed no container id".to_string(),
                ));
            }
            Ok(id.chars().take(12).collect())
        })
    }

    fn query<'a>(&'a self, job_ids: &'a [String]) -> BoxFuture<'a, Result<HashMap<String, JobState>>> {
        Box::pin(async move {
            let mut states = HashMap::new();
            for id in job_ids {
                let spec = self.docker().args([
                    "inspect",
                    "-f",
                    "{{.State.Status}}|{{.State.ExitCode}}",
                    id.as_str(),
                ]);
                let out = self.runner.run(spec).await?;
                let state = if out.success() {
                    parse_inspect(&out.stdout)
                } else {
                    JobState::Unknown
                };
                states.insert(id.clone(), state);
            }
            Ok(states)
        })
    }

    fn failure_detail<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let spec = self.docker().args(["logs", "--tail", LOG_TAIL_LINES, job_id]);
            match self.runner.run(spec).await {
                Ok(out) => {
                    // docker logs replays the container's stderr on our stderr.
                    let text = format!("{}{}", out.stdout, out.stderr);
                    let text = text.trim();
                    (!text.is_empty()).then(|| text.to_string())
                }
                Err(_) => None,
            }
        })
    }

    fn release<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let spec = self.docker().args(["rm", "-f", job_id]);
            self.checked(spec, "removing container").await?;
            Ok(())
        })
    }

    fn cancel<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<()>> {
        self.release(job_id)
    }

    fn host_path(&self, reported: &str) -> PathBuf {
        match Path::new(reported).strip_prefix(CONTAINER_OUTPUT_DIR) {
            Ok(rel) => self.host_output_dir.join(rel),
            Err(_) => PathBuf::from(reported),
        }
    }
}
