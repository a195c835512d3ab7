// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod sched;
pub mod store;
pub mod summary;
pub mod types;
pub mod worker;

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::cli::{CliArgs, Command, RunArgs};
use crate::config::loader::load_raw;
use crate::config::model::ConfigFile;
use crate::exec::command::{CommandRunner, ProcessRunner};
use crate::orchestrator::{Orchestrator, render_plan};

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    match args.command {
        Command::Run(run_args) => run_command(&run_args, runner).await,
        Command::Worker(worker_args) => {
            let ok = worker::run_worker(&worker_args, runner).await?;
            Ok(if ok { 0 } else { 1 })
        }
    }
}

async fn run_command(args: &RunArgs, runner: Arc<dyn CommandRunner>) -> Result<i32> {
    let mut raw = load_raw(args.config.as_deref())?;
    args.apply_overrides(&mut raw);
    let cfg = ConfigFile::try_from(raw)?;
    debug!(?cfg, "configuration resolved");

    let orchestrator = Orchestrator::new(cfg, runner);
    let report = orchestrator.run(&args.requirements, args.dry_run).await?;

    match &report.summary {
        Some(summary) => print!("{}", summary.render()),
        None => print!("{}", render_plan(&report.plan)),
    }
    println!("\noutputs: {}", report.run_dir.display());

    Ok(if report.success() { 0 } else { 1 })
}
