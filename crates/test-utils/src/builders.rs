use std::path::{Path, PathBuf};

use taskfleet::backend::RunContext;
use taskfleet::config::{ConfigFile, RawConfigFile};
use taskfleet::exec::ExecutorSpec;
use taskfleet::plan::{ExecutionPlan, Task};
use taskfleet::types::{BackendKind, PlannerKind};

/// Builder for `Task`.
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: Task::new(id, format!("work for {id}")),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.task.dependencies.push(dep.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Validated plan from builders; panics on an invalid plan.
pub fn plan(budget: usize, tasks: Vec<TaskBuilder>) -> ExecutionPlan {
    ExecutionPlan::from_tasks(
        "test requirements",
        budget,
        tasks.into_iter().map(TaskBuilder::build).collect(),
    )
    .expect("Failed to build valid plan from builders")
}

pub fn run_context(run_dir: &Path) -> RunContext {
    RunContext {
        run_id: "20260101T000000Z_0123abcd".to_string(),
        requirements: "test requirements".to_string(),
        run_dir: run_dir.to_path_buf(),
        executor: ExecutorSpec::Simulated { duration_ms: 1 },
    }
}

/// Builder for `ConfigFile`, starting from defaults tuned for fast tests
/// (millisecond backoff and polling).
pub struct ConfigBuilder {
    raw: RawConfigFile,
}

impl ConfigBuilder {
    pub fn new(output_dir: &Path) -> Self {
        let mut raw = RawConfigFile::default();
        raw.orchestrator.output_dir = output_dir.to_path_buf();
        raw.orchestrator.poll_interval = "10ms".to_string();
        raw.orchestrator.simulated_task_time = "5ms".to_string();
        raw.retry.base_delay = "10ms".to_string();
        Self { raw }
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.raw.orchestrator.backend = backend;
        self
    }

    pub fn max_workers(mut self, m: usize) -> Self {
        self.raw.orchestrator.max_workers = m;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.raw.retry.max_retries = n;
        self
    }

    pub fn timeout(mut self, t: &str) -> Self {
        self.raw.orchestrator.timeout = Some(t.to_string());
        self
    }

    pub fn slurm_shared_dir(mut self, dir: PathBuf) -> Self {
        self.raw.slurm.shared_dir = Some(dir);
        self
    }

    pub fn bucket(mut self, bucket: &str) -> Self {
        self.raw.cloud.bucket = Some(bucket.to_string());
        self
    }

    pub fn batch_queue(mut self, queue: &str, definition: &str) -> Self {
        self.raw.batch.job_queue = Some(queue.to_string());
        self.raw.batch.job_definition = Some(definition.to_string());
        self
    }

    pub fn planner(mut self, planner: PlannerKind) -> Self {
        self.raw.orchestrator.planner = planner;
        self
    }

    pub fn docker_network(mut self, network: &str) -> Self {
        self.raw.docker.network = Some(network.to_string());
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.raw).expect("Failed to build valid config from builder")
    }
}
