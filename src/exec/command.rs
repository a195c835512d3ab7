// src/exec/command.rs

//! External process invocation.
//!
//! Every call to an outside tool (`docker`, `sbatch`, `squeue`, `aws`, the
//! LLM CLI) goes through a [`CommandRunner`], so backends and collaborators
//! can be exercised in tests with scripted fakes instead of real binaries.

use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::{Result, TaskfleetError};
use crate::types::BoxFuture;

/// Default upper bound for short control-plane commands (submit, query, cancel).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Description of one external command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the child's stdin before waiting, if any.
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `program arg1 arg2 ...`, for logs and error messages.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `-1` when the process was terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Stderr if non-empty, otherwise stdout; trimmed.
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// Abstraction over running external programs.
pub trait CommandRunner: Send + Sync + Debug {
    /// Run the command to completion (or until its timeout elapses).
    ///
    /// A non-zero exit is **not** an error here; callers inspect
    /// [`CommandOutput::code`]. Errors mean the command could not be run.
    fn run(&self, spec: CommandSpec) -> BoxFuture<'_, Result<CommandOutput>>;

    /// Whether `program` can be found on this machine.
    fn locate(&self, program: &str) -> bool;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: CommandSpec) -> BoxFuture<'_, Result<CommandOutput>> {
        Box::pin(async move { run_process(spec).await })
    }

    fn locate(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

async fn run_process(spec: CommandSpec) -> Result<CommandOutput> {
    debug!(command = %spec.display(), "running external command");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    if let Some(ref dir) = spec.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning `{}`", spec.program))?;

    if let Some(bytes) = spec.stdin.as_deref() {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(bytes)
                .await
                .with_context(|| format!("writing stdin of `{}`", spec.program))?;
            // Dropping closes the pipe so the child sees EOF.
            drop(stdin);
        }
    }

    let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
        Ok(res) => res.with_context(|| format!("waiting for `{}`", spec.program))?,
        Err(_) => {
            // The child is killed when its handle is dropped (kill_on_drop).
            warn!(
                command = %spec.display(),
                timeout_secs = spec.timeout.as_secs(),
                "external command timed out"
            );
            return Err(TaskfleetError::Backend(format!(
                "`{}` timed out after {}s",
                spec.program,
                spec.timeout.as_secs()
            )));
        }
    };

    let result = CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };

    debug!(
        program = %spec.program,
        exit_code = result.code,
        "external command finished"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_arguments() {
        let spec = CommandSpec::new("docker")
            .arg("inspect")
            .args(["-f", "{{.State.Status}}"])
            .timeout(Duration::from_secs(5));

        assert_eq!(spec.display(), "docker inspect -f {{.State.Status}}");
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert!(spec.stdin.is_none());
    }

    #[test]
    fn diagnostic_prefers_stderr() {
        let out = CommandOutput {
            code: 1,
            stdout: "partial".into(),
            stderr: "  boom \n".into(),
        };
        assert_eq!(out.diagnostic(), "boom");

        let out = CommandOutput {
            code: 1,
            stdout: " only stdout ".into(),
            stderr: String::new(),
        };
        assert_eq!(out.diagnostic(), "only stdout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_captures_output_and_stdin() {
        let runner = ProcessRunner;
        let out = runner
            .run(CommandSpec::new("cat").stdin(b"hello".to_vec()))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello");

        let out = runner
            .run(CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.diagnostic(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_enforces_timeout() {
        let err = ProcessRunner
            .run(CommandSpec::new("sleep").arg("5").timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskfleetError::Backend(msg) if msg.contains("timed out")));
    }
}
