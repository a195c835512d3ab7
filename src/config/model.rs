// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::LlmSettings;
use crate::types::{BackendKind, PlannerKind};

/// Configuration as read from a TOML file, before validation.
///
/// ```toml
/// [orchestrator]
/// max_workers = 4
/// backend = "slurm"
/// poll_interval = "10s"
///
/// [retry]
/// max_retries = 3
/// base_delay = "5s"
///
/// [slurm]
/// partition = "cpu"
/// shared_dir = "/shared/taskfleet"
/// ```
///
/// Every section is optional. Durations are kept as strings here and parsed
/// when the raw file is turned into a [`ConfigFile`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub orchestrator: RawOrchestratorSection,
    #[serde(default)]
    pub retry: RawRetrySection,
    #[serde(default)]
    pub llm: RawLlmSection,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub slurm: SlurmConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawOrchestratorSection {
    pub max_workers: usize,
    pub backend: BackendKind,
    pub output_dir: PathBuf,
    /// Run tasks through the LLM CLI instead of the simulated executor.
    pub real: bool,
    pub planner: PlannerKind,
    pub poll_interval: String,
    pub timeout: Option<String>,
    pub simulated_task_time: String,
}

impl Default for RawOrchestratorSection {
    fn default() -> Self {
        Self {
            max_workers: 5,
            backend: BackendKind::default(),
            output_dir: PathBuf::from("outputs/taskfleet"),
            real: false,
            planner: PlannerKind::default(),
            poll_interval: "5s".to_string(),
            timeout: None,
            simulated_task_time: "1s".to_string(),
        }
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawRetrySection {
    /// Total attempts per task, including the first.
    pub max_retries: u32,
    pub base_delay: String,
    pub multiplier: f64,
    pub max_delay: Option<String>,
}

impl Default for RawRetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: "5s".to_string(),
            multiplier: 2.0,
            max_delay: None,
        }
    }
}

/// `[llm]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawLlmSection {
    pub binary: String,
    pub model: Option<String>,
    pub timeout: String,
}

impl Default for RawLlmSection {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            timeout: "5m".to_string(),
        }
    }
}

/// `[docker]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    pub binary: String,
    pub image: String,
    /// Created at initialization if it does not exist.
    pub network: Option<String>,
    /// Environment variables forwarded into every container.
    pub pass_env: Vec<String>,
    /// Program and subcommand the image runs for one attempt.
    pub worker_command: Vec<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            image: "taskfleet:latest".to_string(),
            network: None,
            pass_env: [
                "ANTHROPIC_API_KEY",
                "AWS_ACCESS_KEY_ID",
                "AWS_SECRET_ACCESS_KEY",
                "AWS_SESSION_TOKEN",
            ]
            .map(String::from)
            .to_vec(),
            worker_command: default_worker_command(),
        }
    }
}

fn default_worker_command() -> Vec<String> {
    vec!["taskfleet".to_string(), "worker".to_string()]
}

/// `[slurm]` section, shared by the `slurm` and `parallel-cluster` backends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlurmConfig {
    pub partition: String,
    /// `--time`, in any format sbatch accepts (`HH:MM:SS`, `D-HH:MM`).
    pub time_limit: String,
    /// `--mem`, e.g. `4G`.
    pub memory: String,
    pub cpus_per_task: u32,
    pub gpus_per_task: u32,
    /// Used instead of `partition` when GPUs are requested.
    pub gpu_partition: Option<String>,
    /// Directory visible from every compute node. Defaults to the output dir.
    pub shared_dir: Option<PathBuf>,
    pub worker_command: Vec<String>,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            partition: "compute".to_string(),
            time_limit: "01:00:00".to_string(),
            memory: "4G".to_string(),
            cpus_per_task: 1,
            gpus_per_task: 0,
            gpu_partition: None,
            shared_dir: None,
            worker_command: default_worker_command(),
        }
    }
}

/// `[cloud]` section: object storage for the cloud backends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudConfig {
    pub bucket: Option<String>,
    pub prefix: String,
    pub region: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: "taskfleet".to_string(),
            region: "eu-central-1".to_string(),
        }
    }
}

/// `[batch]` section.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub job_queue: Option<String>,
    pub job_definition: Option<String>,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub timeout_secs: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            job_queue: None,
            job_definition: None,
            vcpus: 1,
            memory_mb: 2048,
            timeout_secs: 3600,
        }
    }
}

/// Validated configuration.
///
/// Constructed only through `TryFrom<RawConfigFile>` (see `validate.rs`),
/// so every duration is parsed and every backend prerequisite is present.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub llm: LlmSettings,
    pub docker: DockerConfig,
    pub slurm: SlurmConfig,
    pub cloud: CloudConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_workers: usize,
    pub backend: BackendKind,
    pub output_dir: PathBuf,
    pub real: bool,
    pub planner: PlannerKind,
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
    pub simulated_task_time: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl ConfigFile {
    /// Defaults for every section; what an empty TOML file yields.
    pub fn defaults() -> crate::errors::Result<Self> {
        Self::try_from(RawConfigFile::default())
    }
}
