// src/backend/threading.rs

//! In-process worker pool: each attempt runs as a tokio task.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backend::RunContext;
use crate::backend::pooled::WorkerPool;
use crate::errors::{Result, TaskfleetError};
use crate::exec::executor::{ExecutionContext, TaskExecutor};
use crate::plan::task::TaskId;
use crate::sched::{AttemptOutcome, AttemptReport, Dispatch};
use crate::types::BoxFuture;

#[derive(Debug)]
struct Worker {
    slot: usize,
    handle: JoinHandle<()>,
}

/// Worker pool backed by tokio tasks.
///
/// Worker names are `worker-<slot>`, where the slot is the lowest one not
/// currently busy, so a fast worker visibly picks up several tasks in turn.
#[derive(Debug)]
pub struct ThreadPool {
    executor: Arc<dyn TaskExecutor>,
    run_id: String,
    requirements: String,
    output_dir: PathBuf,
    tx: mpsc::UnboundedSender<AttemptReport>,
    rx: mpsc::UnboundedReceiver<AttemptReport>,
    active: HashMap<TaskId, Worker>,
    busy_slots: BTreeSet<usize>,
    stop: CancellationToken,
}

impl ThreadPool {
    pub fn new(executor: Arc<dyn TaskExecutor>, run: &RunContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            executor,
            run_id: run.run_id.clone(),
            requirements: run.requirements.clone(),
            output_dir: run.tasks_dir(),
            tx,
            rx,
            active: HashMap::new(),
            busy_slots: BTreeSet::new(),
            stop: CancellationToken::new(),
        }
    }

    fn free_slot(&self) -> usize {
        (0..).find(|s| !self.busy_slots.contains(s)).unwrap_or(self.busy_slots.len())
    }
}

impl WorkerPool for ThreadPool {
    fn prepare(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn dispatch(&mut self, dispatch: Dispatch) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let slot = self.free_slot();
            let worker = format!("worker-{slot}");
            let task_id = dispatch.task.id.clone();

            let ctx = ExecutionContext {
                run_id: self.run_id.clone(),
                output_dir: self.output_dir.clone(),
                attempt: dispatch.attempt,
                requirements: self.requirements.clone(),
            };
            let executor = Arc::clone(&self.executor);
            let tx = self.tx.clone();
            let name = worker.clone();
            let stop = self.stop.child_token();

            let handle = tokio::spawn(async move {
                let started = Instant::now();
                let task = dispatch.task;

                // Run the executor in its own task so a panic is reported as
                // a failed attempt instead of a lost worker.
                let inner = {
                    let task = task.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            res = executor.execute(&task, &ctx) => Some(res),
                            _ = stop.cancelled() => None,
                        }
                    })
                };
                let outcome = match inner.await {
                    Ok(Some(Ok(output))) => AttemptOutcome::Succeeded {
                        artifacts: output.artifacts,
                    },
                    Ok(Some(Err(e))) => AttemptOutcome::Failed {
                        error: e.to_string(),
                    },
                    Ok(None) => return,
                    Err(join) if join.is_panic() => AttemptOutcome::Failed {
                        error: "worker panicked".to_string(),
                    },
                    Err(_) => return,
                };

                let report = AttemptReport {
                    task_id: task.id,
                    attempt: dispatch.attempt,
                    worker: name,
                    duration: started.elapsed(),
                    outcome,
                };
                // The receiver only disappears when the pool is dropped.
                let _ = tx.send(report);
            });

            debug!(task = %task_id, worker = %worker, "spawned in-process worker");
            self.busy_slots.insert(slot);
            self.active.insert(task_id, Worker { slot, handle });
            Ok(worker)
        })
    }

    fn next_completion(&mut self) -> BoxFuture<'_, Result<AttemptReport>> {
        Box::pin(async move {
            let report = self.rx.recv().await.ok_or_else(|| {
                TaskfleetError::InternalConsistency("worker channel closed".to_string())
            })?;
            if let Some(worker) = self.active.remove(&report.task_id) {
                self.busy_slots.remove(&worker.slot);
            }
            Ok(report)
        })
    }

    fn shutdown(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.active.is_empty() {
                warn!(workers = self.active.len(), "aborting in-flight workers");
            }
            self.stop.cancel();
            for (task, worker) in self.active.drain() {
                worker.handle.abort();
                debug!(task = %task, slot = worker.slot, "worker aborted");
            }
            self.busy_slots.clear();
            Ok(())
        })
    }
}
