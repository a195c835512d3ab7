use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use taskfleet::errors::{Result, TaskfleetError};
use taskfleet::exec::{ExecutionContext, TaskExecutor};
use taskfleet::plan::{Task, TaskOutput};
use taskfleet::types::BoxFuture;

/// One finished attempt as seen by a [`RecordingExecutor`].
#[derive(Debug, Clone)]
pub struct ExecEvent {
    pub task: String,
    pub attempt: u32,
    pub start: Instant,
    pub end: Instant,
    pub success: bool,
}

#[derive(Debug, Default)]
struct Script {
    /// Task -> number of leading attempts that fail.
    fail_first: HashMap<String, u32>,
    always_fail: Vec<String>,
    delays: HashMap<String, Duration>,
}

/// A fake executor that:
/// - sleeps for a configurable time per task
/// - fails programmed attempts
/// - records start/end timestamps and the peak number of concurrent attempts.
#[derive(Debug, Clone)]
pub struct RecordingExecutor {
    work: Duration,
    script: Arc<Mutex<Script>>,
    events: Arc<Mutex<Vec<ExecEvent>>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RecordingExecutor {
    pub fn new(work: Duration) -> Self {
        Self {
            work,
            script: Arc::default(),
            events: Arc::default(),
            running: Arc::default(),
            peak: Arc::default(),
        }
    }

    /// Fail the first `k` attempts of `task`, then succeed.
    pub fn fail_first(self, task: &str, k: u32) -> Self {
        self.script.lock().unwrap().fail_first.insert(task.to_string(), k);
        self
    }

    pub fn always_fail(self, task: &str) -> Self {
        self.script.lock().unwrap().always_fail.push(task.to_string());
        self
    }

    pub fn delay(self, task: &str, d: Duration) -> Self {
        self.script.lock().unwrap().delays.insert(task.to_string(), d);
        self
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Task ids in the order their attempts started.
    pub fn start_order(&self) -> Vec<String> {
        let mut events = self.events();
        events.sort_by_key(|e| e.start);
        events.into_iter().map(|e| e.task).collect()
    }

    pub fn attempts(&self, task: &str) -> usize {
        self.events().iter().filter(|e| e.task == task).count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn should_fail(&self, task: &str, attempt: u32) -> bool {
        let script = self.script.lock().unwrap();
        script.always_fail.iter().any(|t| t == task)
            || script.fail_first.get(task).is_some_and(|k| attempt <= *k)
    }

    fn work_for(&self, task: &str) -> Duration {
        self.script.lock().unwrap().delays.get(task).copied().unwrap_or(self.work)
    }
}

impl TaskExecutor for RecordingExecutor {
    fn execute<'a>(&'a self, task: &'a Task, ctx: &'a ExecutionContext) -> BoxFuture<'a, Result<TaskOutput>> {
        Box::pin(async move {
            let start = Instant::now();
            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);

            tokio::time::sleep(self.work_for(&task.id)).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            let success = !self.should_fail(&task.id, ctx.attempt);
            self.events.lock().unwrap().push(ExecEvent {
                task: task.id.clone(),
                attempt: ctx.attempt,
                start,
                end: Instant::now(),
                success,
            });

            if success {
                Ok(TaskOutput::default())
            } else {
                Err(TaskfleetError::task(
                    task.id.clone(),
                    format!("scripted failure on attempt {}", ctx.attempt),
                ))
            }
        })
    }
}
