// src/exec/mod.rs

//! Process and task execution layer.
//!
//! - [`command`] runs external programs (`docker`, `sbatch`, `aws`, the LLM
//!   CLI) behind the [`CommandRunner`] trait so tests can script them.
//! - [`executor`] turns one task attempt into artifacts, either simulated or
//!   through the LLM CLI.

pub mod command;
pub mod executor;

pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use executor::{ExecutionContext, ExecutorSpec, LlmTaskExecutor, SimulatedExecutor, TaskExecutor};
