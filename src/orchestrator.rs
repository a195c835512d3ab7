// src/orchestrator.rs

//! One end-to-end run: plan, execute on the configured backend, summarise.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{ExecutionBackend, RunContext, build_backend};
use crate::config::model::ConfigFile;
use crate::errors::{Result, TaskfleetError};
use crate::exec::command::CommandRunner;
use crate::exec::executor::{ExecutorSpec, TaskExecutor};
use crate::llm::ClaudeCli;
use crate::plan::{ExecutionPlan, HeuristicPlanner, LlmPlanner, Planner};
use crate::sched::RunOutcome;
use crate::summary::RunSummary;
use crate::types::PlannerKind;

pub const PLAN_FILE: &str = "execution_plan.json";
pub const SUMMARY_FILE: &str = "execution_summary.json";

/// `<UTC timestamp>_<8 hex chars>`, e.g. `20260301T101500Z_1a2b3c4d`.
pub fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{stamp}_{suffix}")
}

/// What `execution_plan.json` contains.
#[derive(Debug, Serialize)]
struct PlanDocument<'a> {
    run_id: &'a str,
    created_at: DateTime<Utc>,
    backend: &'a str,
    max_workers: usize,
    plan: &'a ExecutionPlan,
}

/// Everything a caller may want to inspect after a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub plan: Arc<ExecutionPlan>,
    /// `None` for dry runs.
    pub outcome: Option<RunOutcome>,
    pub summary: Option<RunSummary>,
}

impl RunReport {
    /// True when every task completed; dry runs count as success.
    pub fn success(&self) -> bool {
        self.summary.as_ref().is_none_or(|s| s.success)
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    cfg: ConfigFile,
    runner: Arc<dyn CommandRunner>,
    planner: Option<Arc<dyn Planner>>,
    executor: Option<Arc<dyn TaskExecutor>>,
}

impl Orchestrator {
    pub fn new(cfg: ConfigFile, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cfg,
            runner,
            planner: None,
            executor: None,
        }
    }

    /// Use `planner` instead of the configured one.
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Use `executor` for in-process workers instead of building one from
    /// configuration.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn config(&self) -> &ConfigFile {
        &self.cfg
    }

    fn planner(&self) -> Result<Arc<dyn Planner>> {
        if let Some(p) = &self.planner {
            return Ok(Arc::clone(p));
        }
        match self.cfg.orchestrator.planner {
            PlannerKind::Heuristic => Ok(Arc::new(HeuristicPlanner)),
            PlannerKind::Llm => {
                let client = ClaudeCli::new(self.cfg.llm.clone(), Arc::clone(&self.runner));
                if !client.is_available() {
                    return Err(TaskfleetError::Planning(format!(
                        "LLM planner selected but '{}' is not on PATH",
                        self.cfg.llm.binary
                    )));
                }
                Ok(Arc::new(LlmPlanner::new(Arc::new(client))))
            }
        }
    }

    fn executor_spec(&self) -> ExecutorSpec {
        if self.cfg.orchestrator.real {
            ExecutorSpec::from_llm_settings(&self.cfg.llm)
        } else {
            let ms = self.cfg.orchestrator.simulated_task_time.as_millis();
            ExecutorSpec::Simulated {
                duration_ms: u64::try_from(ms).unwrap_or(u64::MAX),
            }
        }
    }

    /// Turn requirements into a validated plan with budget `max_workers`.
    pub async fn plan(&self, requirements: &str) -> Result<ExecutionPlan> {
        let planner = self.planner()?;
        let plan = planner
            .plan(requirements, self.cfg.orchestrator.max_workers)
            .await
            .map_err(|e| match e {
                TaskfleetError::Planning(_) => e,
                other => TaskfleetError::Planning(other.to_string()),
            })?;
        info!(tasks = plan.len(), budget = plan.budget(), "plan ready");
        Ok(plan)
    }

    /// Plan and, unless `dry_run`, execute `requirements`.
    pub async fn run(&self, requirements: &str, dry_run: bool) -> Result<RunReport> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_id = new_run_id();
        let run_dir = self.cfg.orchestrator.output_dir.join(&run_id);
        tokio::fs::create_dir_all(&run_dir).await?;
        info!(run_id = %run_id, dir = %run_dir.display(), "run started");

        let plan = Arc::new(self.plan(requirements).await?);
        self.save_plan(&run_id, &run_dir, &plan).await?;

        if dry_run {
            return Ok(RunReport {
                run_id,
                run_dir,
                plan,
                outcome: None,
                summary: None,
            });
        }

        let spec = self.executor_spec();
        let executor = match &self.executor {
            Some(e) => Arc::clone(e),
            None => spec.build(Arc::clone(&self.runner)),
        };
        let run = RunContext {
            run_id: run_id.clone(),
            requirements: requirements.to_string(),
            run_dir: run_dir.clone(),
            executor: spec,
        };
        let mut backend = build_backend(&self.cfg, run, executor, Arc::clone(&self.runner))?;
        let backend_name = backend.name();

        let outcome = self.execute(backend.as_mut(), Arc::clone(&plan)).await?;

        let summary = RunSummary::build(
            &run_id,
            backend_name,
            self.cfg.orchestrator.max_workers,
            &plan,
            &outcome,
            started_at,
            clock.elapsed(),
        );
        write_json_file(&run_dir.join(SUMMARY_FILE), &summary).await?;
        info!(
            run_id = %run_id,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            blocked = summary.blocked.len(),
            "run finished"
        );

        Ok(RunReport {
            run_id,
            run_dir,
            plan,
            outcome: Some(outcome),
            summary: Some(summary),
        })
    }

    /// Drive the backend lifecycle; cleanup runs on every path.
    async fn execute(
        &self,
        backend: &mut dyn ExecutionBackend,
        plan: Arc<ExecutionPlan>,
    ) -> Result<RunOutcome> {
        let token = backend.cancel_token();
        let interrupt = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => match res {
                        Ok(()) => {
                            warn!("interrupt received; cancelling run");
                            token.cancel();
                        }
                        Err(e) => error!(error = %e, "failed to listen for Ctrl+C"),
                    },
                    _ = token.cancelled() => {}
                }
            })
        };

        let max_workers = self.cfg.orchestrator.max_workers;
        let result = async {
            backend.initialize().await?;
            backend.submit(plan).await?;
            backend.wait_for_completion(max_workers).await
        }
        .await;

        if let Err(e) = backend.cleanup().await {
            warn!(backend = backend.name(), error = %e, "cleanup failed");
        }
        interrupt.abort();
        result
    }

    async fn save_plan(&self, run_id: &str, run_dir: &Path, plan: &ExecutionPlan) -> Result<()> {
        let doc = PlanDocument {
            run_id,
            created_at: Utc::now(),
            backend: self.cfg.orchestrator.backend.as_str(),
            max_workers: self.cfg.orchestrator.max_workers,
            plan,
        };
        write_json_file(&run_dir.join(PLAN_FILE), &doc).await
    }
}

async fn write_json_file<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Plain-text rendering of a plan for `--dry-run`.
pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = format!("plan: {} task(s), budget {}\n", plan.len(), plan.budget());
    out.push_str(&format!("strategy: {}\n", plan.strategy()));
    for task in plan.tasks() {
        out.push_str(&format!(
            "  - {} [{}] priority={} effort={:?}\n",
            task.id,
            task.display_name(),
            task.priority,
            task.effort
        ));
        if !task.dependencies.is_empty() {
            out.push_str(&format!("      after: {}\n", task.dependencies.join(", ")));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_have_timestamp_and_suffix() {
        let id = new_run_id();
        let (stamp, suffix) = id.split_once('_').unwrap();
        assert_eq!(stamp.len(), "20260101T000000Z".len());
        assert!(stamp.ends_with('Z'));
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_run_id(), id);
    }
}
