// src/llm.rs

//! Client for the external LLM command-line tool.
//!
//! Both planning and real task execution delegate their "thinking" to a
//! single prompt-in / text-out call. [`LlmClient`] is that seam; [`ClaudeCli`]
//! is the production implementation.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::{Result, TaskfleetError};
use crate::exec::command::{CommandRunner, CommandSpec};
use crate::types::BoxFuture;

/// Maximum number of stderr characters carried into an error message.
pub const STDERR_EXCERPT_CHARS: usize = 500;

/// Prompt-in, text-out collaborator.
pub trait LlmClient: Send + Sync + Debug {
    /// Send `prompt` and return the raw textual response.
    ///
    /// `cwd` is the directory the tool runs in, if it matters.
    fn complete<'a>(&'a self, prompt: &'a str, cwd: Option<&'a Path>) -> BoxFuture<'a, Result<String>>;
}

/// Settings for [`ClaudeCli`].
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub binary: String,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: None,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Headless invocation of the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    settings: LlmSettings,
    runner: Arc<dyn CommandRunner>,
}

impl ClaudeCli {
    pub fn new(settings: LlmSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self { settings, runner }
    }

    /// Whether the configured binary is on `PATH`.
    pub fn is_available(&self) -> bool {
        self.runner.locate(&self.settings.binary)
    }

    fn command(&self, prompt: &str, cwd: Option<&Path>) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.settings.binary)
            .args(["--dangerously-skip-permissions", "--print"])
            .timeout(self.settings.timeout);

        if let Some(ref model) = self.settings.model {
            spec = spec.args(["--model", model.as_str()]);
        }
        spec = spec.args(["-p", prompt]);

        if let Some(dir) = cwd {
            spec = spec.cwd(dir);
        }
        spec
    }
}

impl LlmClient for ClaudeCli {
    fn complete<'a>(&'a self, prompt: &'a str, cwd: Option<&'a Path>) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let spec = self.command(prompt, cwd);
            debug!(binary = %self.settings.binary, prompt_chars = prompt.len(), "calling LLM CLI");

            let output = self.runner.run(spec).await?;
            if !output.success() {
                let excerpt = excerpt(&output.stderr, STDERR_EXCERPT_CHARS);
                warn!(exit_code = output.code, "LLM CLI exited with failure");
                return Err(TaskfleetError::Other(anyhow::anyhow!(
                    "{} exited with code {}: {}",
                    self.settings.binary,
                    output.code,
                    excerpt
                )));
            }

            Ok(output.stdout)
        })
    }
}

/// First `max` characters of `s`, on a char boundary.
pub fn excerpt(s: &str, max: usize) -> String {
    s.trim().chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("  héllo wörld ", 5), "héllo");
        assert_eq!(excerpt("short", 500), "short");
    }

    #[derive(Debug)]
    struct NoRunner;

    impl CommandRunner for NoRunner {
        fn run(&self, _spec: CommandSpec) -> BoxFuture<'_, Result<crate::exec::command::CommandOutput>> {
            Box::pin(async { Err(TaskfleetError::Backend("unused".into())) })
        }

        fn locate(&self, _program: &str) -> bool {
            false
        }
    }

    #[test]
    fn command_line_includes_model_and_prompt_last() {
        let cli = ClaudeCli::new(
            LlmSettings {
                model: Some("sonnet".into()),
                ..LlmSettings::default()
            },
            Arc::new(NoRunner),
        );
        let spec = cli.command("build it", None);
        assert_eq!(spec.program, "claude");
        assert_eq!(
            spec.args,
            vec![
                "--dangerously-skip-permissions",
                "--print",
                "--model",
                "sonnet",
                "-p",
                "build it"
            ]
        );
        assert!(!cli.is_available());
    }
}
