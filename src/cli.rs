// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::model::RawConfigFile;
use crate::types::{BackendKind, PlannerKind};

/// Command-line arguments for `taskfleet`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "taskfleet",
    version,
    about = "Plan a requirement into tasks and run them on a pool of workers.",
    long_about = None
)]
pub struct CliArgs {
    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `TASKFLEET_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Plan the requirements, execute every task, print a summary.
    Run(RunArgs),
    /// Execute a single task attempt (run inside a container or cluster job).
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// What to build, in plain language.
    #[arg(value_name = "REQUIREMENTS")]
    pub requirements: String,

    /// Path to the config file (TOML). Defaults to `taskfleet.toml` if present.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(short = 'm', long, value_name = "M")]
    pub max_workers: Option<usize>,

    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Execute tasks through the LLM CLI instead of simulating them.
    #[arg(long)]
    pub real: bool,

    #[arg(long, value_enum)]
    pub planner: Option<PlannerKind>,

    /// Total attempts per task, including the first.
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    #[arg(long, value_name = "DURATION")]
    pub retry_base_delay: Option<String>,

    #[arg(long, value_name = "FACTOR")]
    pub retry_multiplier: Option<f64>,

    #[arg(long, value_name = "DURATION")]
    pub poll_interval: Option<String>,

    /// Give up on the whole run after this long (e.g. `2h`).
    #[arg(long, value_name = "DURATION")]
    pub timeout: Option<String>,

    #[arg(long)]
    pub slurm_partition: Option<String>,

    #[arg(long)]
    pub slurm_mem: Option<String>,

    #[arg(long)]
    pub slurm_time: Option<String>,

    #[arg(long)]
    pub slurm_cpus: Option<u32>,

    #[arg(long)]
    pub slurm_gpus: Option<u32>,

    #[arg(long)]
    pub docker_image: Option<String>,

    #[arg(long)]
    pub docker_network: Option<String>,

    #[arg(long)]
    pub bucket: Option<String>,

    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub batch_job_queue: Option<String>,

    #[arg(long)]
    pub batch_job_definition: Option<String>,

    /// Plan only: print the plan and exit without executing anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    /// Apply command-line overrides on top of file values.
    pub fn apply_overrides(&self, raw: &mut RawConfigFile) {
        let o = &mut raw.orchestrator;
        set(&mut o.max_workers, self.max_workers);
        set(&mut o.backend, self.backend);
        set(&mut o.output_dir, self.output_dir.clone());
        set(&mut o.planner, self.planner);
        set(&mut o.poll_interval, self.poll_interval.clone());
        if self.real {
            o.real = true;
        }
        if self.timeout.is_some() {
            o.timeout = self.timeout.clone();
        }

        let r = &mut raw.retry;
        set(&mut r.max_retries, self.max_retries);
        set(&mut r.base_delay, self.retry_base_delay.clone());
        set(&mut r.multiplier, self.retry_multiplier);

        let s = &mut raw.slurm;
        set(&mut s.partition, self.slurm_partition.clone());
        set(&mut s.memory, self.slurm_mem.clone());
        set(&mut s.time_limit, self.slurm_time.clone());
        set(&mut s.cpus_per_task, self.slurm_cpus);
        set(&mut s.gpus_per_task, self.slurm_gpus);

        set(&mut raw.docker.image, self.docker_image.clone());
        if self.docker_network.is_some() {
            raw.docker.network = self.docker_network.clone();
        }

        if self.bucket.is_some() {
            raw.cloud.bucket = self.bucket.clone();
        }
        set(&mut raw.cloud.prefix, self.prefix.clone());
        set(&mut raw.cloud.region, self.region.clone());

        if self.batch_job_queue.is_some() {
            raw.batch.job_queue = self.batch_job_queue.clone();
        }
        if self.batch_job_definition.is_some() {
            raw.batch.job_definition = self.batch_job_definition.clone();
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// State location: a directory or `s3://bucket/prefix`.
    #[arg(long, value_name = "DIR|URL")]
    pub state: String,

    #[arg(long, value_name = "ID")]
    pub task: String,

    #[arg(long, value_name = "N", default_value_t = 1)]
    pub attempt: u32,

    /// Where to write artifacts. Defaults to a scratch directory whose
    /// contents are uploaded when the state lives in object storage.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// AWS region for object storage state.
    #[arg(long)]
    pub region: Option<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_override_file_values() {
        let args = CliArgs::try_parse_from([
            "taskfleet",
            "run",
            "build a todo app",
            "-m",
            "3",
            "--backend",
            "parallel-cluster",
            "--bucket",
            "my-bucket",
            "--slurm-gpus",
            "2",
            "--max-retries",
            "5",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(run.requirements, "build a todo app");

        let mut raw = RawConfigFile::default();
        raw.slurm.partition = "from-file".into();
        run.apply_overrides(&mut raw);

        assert_eq!(raw.orchestrator.max_workers, 3);
        assert_eq!(raw.orchestrator.backend, BackendKind::ParallelCluster);
        assert_eq!(raw.cloud.bucket.as_deref(), Some("my-bucket"));
        assert_eq!(raw.slurm.gpus_per_task, 2);
        assert_eq!(raw.slurm.partition, "from-file");
        assert_eq!(raw.retry.max_retries, 5);
    }

    #[test]
    fn worker_subcommand_parses() {
        let args = CliArgs::try_parse_from([
            "taskfleet",
            "worker",
            "--state",
            "s3://b/runs/1",
            "--task",
            "task_2",
            "--attempt",
            "3",
        ])
        .unwrap();
        let Command::Worker(w) = args.command else {
            panic!("expected worker subcommand");
        };
        assert_eq!(w.state, "s3://b/runs/1");
        assert_eq!(w.task, "task_2");
        assert_eq!(w.attempt, 3);
        assert!(w.output_dir.is_none());
    }
}
