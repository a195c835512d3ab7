// src/exec/executor.rs

//! Task-execution collaborators.
//!
//! A [`TaskExecutor`] performs the actual work of one task attempt. Backends
//! only care that it eventually returns a [`TaskOutput`] or fails.

use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{Result, TaskfleetError};
use crate::exec::command::CommandRunner;
use crate::llm::{ClaudeCli, LlmClient, LlmSettings};
use crate::plan::task::{Task, TaskOutput};
use crate::types::BoxFuture;

/// Per-attempt information handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    pub run_id: String,
    /// Root under which each task gets its own artifact directory.
    pub output_dir: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Original requirements of the run, for context.
    pub requirements: String,
}

impl ExecutionContext {
    pub fn task_dir(&self, task: &Task) -> PathBuf {
        self.output_dir.join(&task.id)
    }
}

/// Runs one task attempt.
pub trait TaskExecutor: Send + Sync + Debug {
    /// Execute `task`; any error is treated as a failed attempt.
    fn execute<'a>(&'a self, task: &'a Task, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<TaskOutput>>;
}

/// Serializable description of which executor a worker should build.
///
/// Stored alongside task definitions so that out-of-process workers
/// (containers, cluster jobs) run the same collaborator as the orchestrator
/// asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorSpec {
    Simulated { duration_ms: u64 },
    Llm {
        binary: String,
        model: Option<String>,
        timeout_secs: u64,
    },
}

impl ExecutorSpec {
    pub fn from_llm_settings(settings: &LlmSettings) -> Self {
        ExecutorSpec::Llm {
            binary: settings.binary.clone(),
            model: settings.model.clone(),
            timeout_secs: settings.timeout.as_secs(),
        }
    }

    pub fn build(&self, runner: Arc<dyn CommandRunner>) -> Arc<dyn TaskExecutor> {
        match self {
            ExecutorSpec::Simulated { duration_ms } => {
                Arc::new(SimulatedExecutor::new(Duration::from_millis(*duration_ms)))
            }
            ExecutorSpec::Llm {
                binary,
                model,
                timeout_secs,
            } => {
                let settings = LlmSettings {
                    binary: binary.clone(),
                    model: model.clone(),
                    timeout: Duration::from_secs(*timeout_secs),
                };
                Arc::new(LlmTaskExecutor::new(Arc::new(ClaudeCli::new(settings, runner))))
            }
        }
    }
}

/// Sleeps for a fixed time and writes a placeholder artifact.
#[derive(Debug, Clone)]
pub struct SimulatedExecutor {
    work_time: Duration,
}

impl SimulatedExecutor {
    pub fn new(work_time: Duration) -> Self {
        Self { work_time }
    }
}

impl TaskExecutor for SimulatedExecutor {
    fn execute<'a>(&'a self, task: &'a Task, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<TaskOutput>> {
        Box::pin(async move {
            debug!(task = %task.id, attempt = ctx.attempt, "simulating task");
            tokio::time::sleep(self.work_time).await;

            let dir = ctx.task_dir(task);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating task dir {:?}", dir))?;

            let path = dir.join("result.md");
            let body = format!(
                "# {}\n\n{}\n\nSimulated result (run {}, attempt {}).\n",
                task.display_name(),
                task.description,
                ctx.run_id,
                ctx.attempt
            );
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("writing {:?}", path))?;

            Ok(TaskOutput {
                artifacts: vec![path],
                summary: Some(format!("simulated {}", task.display_name())),
            })
        })
    }
}

/// Delegates the task to the LLM and writes the files it returns.
#[derive(Debug, Clone)]
pub struct LlmTaskExecutor {
    client: Arc<dyn LlmClient>,
}

impl LlmTaskExecutor {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn prompt(task: &Task, ctx: &ExecutionContext) -> String {
        format!(
            r#"You are one of several executors working on a larger project.

PROJECT REQUIREMENTS:
{requirements}

YOUR TASK ({id}): {name}
{description}

Produce complete, working files for this task only. Start every file with a
fenced code block whose first line is a comment of the form

# filename: relative/path.ext

followed by the file contents."#,
            requirements = ctx.requirements,
            id = task.id,
            name = task.display_name(),
            description = task.description,
        )
    }
}

impl TaskExecutor for LlmTaskExecutor {
    fn execute<'a>(&'a self, task: &'a Task, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<TaskOutput>> {
        Box::pin(async move {
            let dir = ctx.task_dir(task);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating task dir {:?}", dir))?;

            info!(task = %task.id, attempt = ctx.attempt, "sending task to LLM");
            let response = self
                .client
                .complete(&Self::prompt(task, ctx), Some(&dir))
                .await
                .map_err(|e| TaskfleetError::task(&task.id, e.to_string()))?;

            let response_path = dir.join("response.md");
            tokio::fs::write(&response_path, &response)
                .await
                .with_context(|| format!("writing {:?}", response_path))?;

            let mut artifacts = vec![response_path];
            for (rel, contents) in extract_files(&response) {
                let Some(rel) = sanitize_relative(&rel) else {
                    warn!(task = %task.id, path = %rel, "skipping file outside task directory");
                    continue;
                };
                let path = dir.join(rel);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating dir {:?}", parent))?;
                }
                tokio::fs::write(&path, contents)
                    .await
                    .with_context(|| format!("writing {:?}", path))?;
                artifacts.push(path);
            }

            debug!(task = %task.id, artifacts = artifacts.len(), "LLM task finished");
            Ok(TaskOutput {
                artifacts,
                summary: None,
            })
        })
    }
}

static CODE_BLOCK: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)```").ok());

static FILENAME_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?:#|//|--|<!--)\s*filename:\s*(\S+?)\s*(?:-->)?\s*$").ok());

/// Fenced blocks whose first line names a file, as `(path, contents)`.
pub fn extract_files(response: &str) -> Vec<(String, String)> {
    let (Some(block_re), Some(name_re)) = (CODE_BLOCK.as_ref(), FILENAME_LINE.as_ref()) else {
        return Vec::new();
    };

    block_re
        .captures_iter(response)
        .filter_map(|caps| {
            let body = caps.get(1)?.as_str();
            let (first, rest) = body.split_once('\n').unwrap_or((body, ""));
            let name = name_re.captures(first)?.get(1)?.as_str().to_string();
            Some((name, rest.to_string()))
        })
        .collect()
}

/// Accept only plain relative paths that stay below the task directory.
fn sanitize_relative(raw: &str) -> Option<PathBuf> {
    let path = Path::new(raw);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct CannedLlm(String);

    impl LlmClient for CannedLlm {
        fn complete<'a>(&'a self, _prompt: &'a str, _cwd: Option<&'a Path>) -> BoxFuture<'a, Result<String>> {
            Box::pin(async move { Ok(self.0.clone()) })
        }
    }

    fn ctx(dir: &Path) -> ExecutionContext {
        ExecutionContext {
            run_id: "run".into(),
            output_dir: dir.to_path_buf(),
            attempt: 1,
            requirements: "a todo app".into(),
        }
    }

    #[test]
    fn extracts_named_blocks_only() {
        let response = "intro\n```python\n# filename: app/main.py\nprint('hi')\n```\n\
                        ```\nno name here\n```\n```js\n// filename: web/index.js\nx()\n```";
        let files = extract_files(response);
        assert_eq!(
            files,
            vec![
                ("app/main.py".to_string(), "print('hi')\n".to_string()),
                ("web/index.js".to_string(), "x()\n".to_string()),
            ]
        );
    }

    #[test]
    fn escaping_paths_are_rejected() {
        assert_eq!(sanitize_relative("a/./b.txt"), Some(PathBuf::from("a/b.txt")));
        assert_eq!(sanitize_relative("../etc/passwd"), None);
        assert_eq!(sanitize_relative("/etc/passwd"), None);
        assert_eq!(sanitize_relative("."), None);
    }

    #[tokio::test]
    async fn simulated_executor_writes_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let task = Task::new("task_1", "do a thing");
        let out = SimulatedExecutor::new(Duration::from_millis(1))
            .execute(&task, &ctx(tmp.path()))
            .await
            .unwrap();
        assert_eq!(out.artifacts, vec![tmp.path().join("task_1").join("result.md")]);
        assert!(out.artifacts[0].exists());
    }

    #[tokio::test]
    async fn llm_executor_writes_response_and_files() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = LlmTaskExecutor::new(Arc::new(CannedLlm(
            "```rust\n# filename: src/lib.rs\npub fn f() {}\n```\n```\n# filename: ../escape.txt\nbad\n```".into(),
        )));
        let task = Task::new("t", "lib");
        let out = exec.execute(&task, &ctx(tmp.path())).await.unwrap();

        let dir = tmp.path().join("t");
        assert_eq!(out.artifacts, vec![dir.join("response.md"), dir.join("src/lib.rs")]);
        assert_eq!(std::fs::read_to_string(dir.join("src/lib.rs")).unwrap(), "pub fn f() {}\n");
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn executor_spec_serializes_with_kind_tag() {
        let spec = ExecutorSpec::Simulated { duration_ms: 10 };
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(json, r#"{"kind":"simulated","duration_ms":10}"#);
    }
}
