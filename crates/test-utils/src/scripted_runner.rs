use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use taskfleet::errors::Result;
use taskfleet::exec::{CommandOutput, CommandRunner, CommandSpec};
use taskfleet::store::WorkerReport;
use taskfleet::types::BoxFuture;

type Handler = Box<dyn Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync>;

pub fn success(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failure(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// A fake [`CommandRunner`] that answers from programmed handlers.
///
/// Handlers are tried in registration order; the first one returning
/// `Some` wins. Unmatched commands exit with 127. Every call is recorded.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    handlers: Arc<Mutex<Vec<Handler>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
    missing: Arc<Mutex<BTreeSet<String>>>,
}

impl fmt::Debug for ScriptedRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRunner")
            .field("calls", &self.calls.lock().unwrap().len())
            .finish()
    }
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for any command.
    pub fn handle<F>(&self, f: F) -> &Self
    where
        F: Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().push(Box::new(f));
        self
    }

    /// Answer `program <first_arg> ...` with a fixed output.
    pub fn respond(&self, program: &str, first_arg: &str, output: CommandOutput) -> &Self {
        let program = program.to_string();
        let first_arg = first_arg.to_string();
        self.handle(move |spec| {
            (spec.program == program && spec.args.first().is_some_and(|a| *a == first_arg))
                .then(|| output.clone())
        })
    }

    /// Make `locate(program)` report the program as absent.
    pub fn without(&self, program: &str) -> &Self {
        self.missing.lock().unwrap().insert(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls rendered as `program arg ...`.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    fn answer(&self, spec: &CommandSpec) -> CommandOutput {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .iter()
            .find_map(|h| h(spec))
            .unwrap_or_else(|| failure(127, &format!("unscripted command: {}", spec.display())))
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: CommandSpec) -> BoxFuture<'_, Result<CommandOutput>> {
        self.calls.lock().unwrap().push(spec.clone());
        let out = self.answer(&spec);
        Box::pin(async move { Ok(out) })
    }

    fn locate(&self, program: &str) -> bool {
        !self.missing.lock().unwrap().contains(program)
    }
}

/// Value following `flag` in `args`, if any.
pub fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// The report a worker would write for one attempt.
pub fn worker_report(task: &str, attempt: u32, error: Option<&str>) -> WorkerReport {
    WorkerReport {
        task_id: task.to_string(),
        attempt,
        success: error.is_none(),
        artifacts: Vec::new(),
        error: error.map(str::to_string),
        duration_ms: 1,
        host: Some("fake-node".to_string()),
        finished_at: chrono::Utc::now(),
    }
}

/// Write the report a worker would leave in a directory-backed state store.
pub fn write_worker_report(state_dir: &Path, task: &str, attempt: u32, error: Option<&str>) {
    let report = worker_report(task, attempt, error);
    let path = state_dir.join(format!("reports/{task}.attempt-{attempt}.json"));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, serde_json::to_vec(&report).unwrap()).unwrap();
}
