// src/backend/slurm.rs

//! SLURM job queue driven through `sbatch`, `squeue`, `sacct` and `scancel`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::backend::jobs::{JobQueue, JobRequest, JobState};
use crate::config::model::SlurmConfig;
use crate::errors::{Result, TaskfleetError};
use crate::exec::command::{CommandRunner, CommandSpec};
use crate::types::BoxFuture;

const OUTPUT_TAIL_LINES: usize = 50;

static JOB_ID: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\s*(\d+)").ok());

#[derive(Debug, Clone)]
pub struct SlurmQueue {
    cfg: SlurmConfig,
    runner: Arc<dyn CommandRunner>,
    /// Where job scripts and their `.out` files are written. Must be visible
    /// from the compute nodes for the output tail to be readable.
    script_dir: PathBuf,
    /// Job id -> `.out` file, for failure diagnostics.
    outputs: Arc<std::sync::Mutex<HashMap<String, PathBuf>>>,
}

impl SlurmQueue {
    pub fn new(cfg: SlurmConfig, runner: Arc<dyn CommandRunner>, script_dir: PathBuf) -> Self {
        Self {
            cfg,
            runner,
            script_dir,
            outputs: Arc::default(),
        }
    }

    pub fn script_dir(&self) -> &PathBuf {
        &self.script_dir
    }

    /// Job script for one attempt.
    pub fn render_script(&self, request: &JobRequest) -> String {
        let cfg = &self.cfg;
        let partition = match (&cfg.gpu_partition, cfg.gpus_per_task) {
            (Some(gpu), n) if n > 0 => gpu.as_str(),
            _ => cfg.partition.as_str(),
        };
        let out_file = self.script_dir.join(format!("{}.out", request.name));

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={}", request.name),
            format!("#SBATCH --partition={partition}"),
            format!("#SBATCH --time={}", cfg.time_limit),
            format!("#SBATCH --mem={}", cfg.memory),
            format!("#SBATCH --cpus-per-task={}", cfg.cpus_per_task),
            format!("#SBATCH --output={}", out_file.display()),
        ];
        if cfg.gpus_per_task > 0 {
            lines.push(format!("#SBATCH --gres=gpu:{}", cfg.gpus_per_task));
        }
        lines.push(String::new());
        lines.push("set -euo pipefail".to_string());

        let command: Vec<String> = cfg
            .worker_command
            .iter()
            .chain(request.flags())
            .map(|a| shell_quote(a))
            .collect();
        lines.push(format!("exec {}", command.join(" ")));
        lines.push(String::new());
        lines.join("\n")
    }

    fn output_file(&self, job_id: &str) -> Option<PathBuf> {
        self.outputs.lock().ok()?.get(job_id).cloned()
    }

    async fn squeue(&self, ids: &str) -> Result<HashMap<String, JobState>> {
        let spec = CommandSpec::new("squeue").args(["-h", "-j", ids, "-o", "%i|%T"]);
        let out = self.runner.run(spec).await?;
        if !out.success() {
            // squeue fails for ids it no longer knows; sacct answers for those.
            debug!(error = %out.diagnostic(), "squeue returned an error");
            return Ok(HashMap::new());
        }
        Ok(parse_state_lines(&out.stdout))
    }

    async fn sacct(&self, ids: &str) -> Result<HashMap<String, JobState>> {
        let spec = CommandSpec::new("sacct").args(["-j", ids, "-n", "-P", "-X", "-o", "JobID,State"]);
        let out = self.runner.run(spec).await?;
        if !out.success() {
            warn!(error = %out.diagnostic(), "sacct returned an error");
            return Ok(HashMap::new());
        }
        Ok(parse_state_lines(&out.stdout))
    }
}

/// Quote `arg` for a POSIX shell unless it is obviously safe.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Map a SLURM job state name to a [`JobState`].
pub fn map_state(state: &str) -> JobState {
    // sacct prints e.g. "CANCELLED by 1000".
    let state = state.split_whitespace().next().unwrap_or_default();
    match state {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESV_DEL_HOLD" | "SUSPENDED" => JobState::Queued,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" => JobState::Running,
        "COMPLETED" => JobState::Succeeded,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" => JobState::Failed(format!("slurm state {state}")),
        _ => JobState::Unknown,
    }
}

/// Parse `<id>|<STATE>` lines as printed by `squeue -o %i|%T` and
/// `sacct -P -o JobID,State`.
pub fn parse_state_lines(text: &str) -> HashMap<String, JobState> {
    text.lines()
        .filter_map(|line| {
            let (id, state) = line.trim().split_once('|')?;
            Some((id.trim().to_string(), map_state(state.trim())))
        })
        .collect()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

impl JobQueue for SlurmQueue {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn check_available(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for tool in ["sbatch", "squeue", "scancel"] {
                if !self.runner.locate(tool) {
                    return Err(TaskfleetError::Initialization(format!(
                        "'{tool}' not found on PATH; is this a SLURM login node?"
                    )));
                }
            }
            let out = self
                .runner
                .run(CommandSpec::new("sbatch").arg("--version"))
                .await
                .map_err(|e| TaskfleetError::Initialization(e.to_string()))?;
            if !out.success() {
                return Err(TaskfleetError::Initialization(format!(
                    "sbatch is not usable: {}",
                    out.diagnostic()
                )));
            }
            tokio::fs::create_dir_all(&self.script_dir).await.map_err(|e| {
                TaskfleetError::Initialization(format!(
                    "cannot create job script directory {}: {e}",
                    self.script_dir.display()
                ))
            })?;
            debug!(version = %out.stdout.trim(), "slurm available");
            Ok(())
        })
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let script_path = self.script_dir.join(format!("{}.sh", request.name));
            tokio::fs::write(&script_path, self.render_script(request)).await?;

            let spec = CommandSpec::new("sbatch")
                .arg("--parsable")
                .arg(script_path.display().to_string());
            let out = self.runner.run(spec).await?;
            if !out.success() {
                return Err(TaskfleetError::Backend(format!(
                    "sbatch rejected {}: {}",
                    request.name,
                    out.diagnostic()
                )));
            }

            let job_id = JOB_ID
                .as_ref()
                .and_then(|re| re.captures(&out.stdout))
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| {
                    TaskfleetError::Backend(format!(
                        "could not parse job id from sbatch output '{}'",
                        out.stdout.trim()
                    ))
                })?;

            if let Ok(mut outputs) = self.outputs.lock() {
                outputs.insert(job_id.clone(), self.script_dir.join(format!("{}.out", request.name)));
            }
            Ok(job_id)
        })
    }

    fn query<'a>(&'a self, job_ids: &'a [String]) -> BoxFuture<'a, Result<HashMap<String, JobState>>> {
        Box::pin(async move {
            if job_ids.is_empty() {
                return Ok(HashMap::new());
            }
            let mut states = self.squeue(&job_ids.join(",")).await?;

            let missing: Vec<&str> = job_ids
                .iter()
                .filter(|id| !states.contains_key(id.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                // Accounting may lag behind; ids still missing stay Unknown.
                states.extend(self.sacct(&missing.join(",")).await?);
            }
            Ok(states)
        })
    }

    fn failure_detail<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let path = self.output_file(job_id)?;
            let text = tokio::fs::read_to_string(&path).await.ok()?;
            let text = tail(&text, OUTPUT_TAIL_LINES);
            (!text.trim().is_empty()).then_some(text)
        })
    }

    fn cancel<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let out = self.runner.run(CommandSpec::new("scancel").arg(job_id)).await?;
            if !out.success() {
                return Err(TaskfleetError::Backend(format!(
                    "scancel {job_id} failed: {}",
                    out.diagnostic()
                )));
            }
            Ok(())
        })
    }
}
