// src/sched/scheduler.rs

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{Result, TaskfleetError};
use crate::plan::model::ExecutionPlan;
use crate::plan::task::{RetryRecord, TaskId, TaskResult, TaskStatus};
use crate::sched::retry::RetryPolicy;
use crate::sched::scheduler_step::SchedulerStep;
use crate::sched::state_manager::{self, ReadyKey, StateManager, ready_key};
use crate::sched::task_info::{AttemptOutcome, AttemptReport, Dispatch, TaskInfo, TaskStatusRecord};

/// Upper bound used when a backoff delay does not fit into an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct RetryWait {
    index: usize,
    not_before: Instant,
}

/// Final state of a run, handed back by `wait_for_completion`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// One result per `Completed` or `Failed` task, in plan order.
    pub results: Vec<TaskResult>,
    /// Final status of every task, in plan order.
    pub statuses: Vec<TaskStatusRecord>,
    /// Tasks that never ran because a dependency failed permanently.
    pub blocked: Vec<TaskId>,
}

impl RunOutcome {
    pub fn all_completed(&self) -> bool {
        self.statuses.iter().all(|s| s.status == TaskStatus::Completed)
    }

    pub fn result_for(&self, id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.task_id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.statuses.iter().find(|s| s.id == id).map(|s| s.status)
    }
}

/// Deterministic task-queue scheduler shared by every backend.
///
/// The scheduler owns all task status; backends only dispatch what it hands
/// out and feed finished attempts back in. It performs no IO and never
/// sleeps; time is passed in explicitly so it can be driven step by step.
///
/// Rules:
/// - at most `max_workers` tasks are `Running` at once
/// - a task is dispatched only when all of its dependencies are `Completed`
/// - among ready tasks the highest priority wins, ties go to plan order
/// - a failed attempt is retried after a backoff while the policy allows it;
///   otherwise the task is `Failed` and its dependents are `Blocked`
#[derive(Debug)]
pub struct Scheduler {
    plan: Arc<ExecutionPlan>,
    tasks: Vec<TaskInfo>,
    ready: BTreeSet<ReadyKey>,
    waiting: Vec<RetryWait>,
    running: usize,
    max_workers: usize,
    max_retries: u32,
    policy: Arc<dyn RetryPolicy>,
}

impl Scheduler {
    /// Build a scheduler for `plan`, running at most `max_workers` tasks
    /// concurrently (clamped to at least one).
    pub fn new(
        plan: Arc<ExecutionPlan>,
        max_workers: usize,
        policy: Arc<dyn RetryPolicy>,
        max_retries: u32,
    ) -> Self {
        let tasks: Vec<TaskInfo> = plan
            .tasks()
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, mut task)| {
                task.status = TaskStatus::Pending;
                TaskInfo::new(i, task)
            })
            .collect();

        let mut scheduler = Self {
            plan,
            tasks,
            ready: BTreeSet::new(),
            waiting: Vec::new(),
            running: 0,
            max_workers: max_workers.max(1),
            max_retries: max_retries.max(1),
            policy,
        };

        let ids: Vec<TaskId> = scheduler.tasks.iter().map(|t| t.task.id.clone()).collect();
        let initially_ready = scheduler
            .manager()
            .promote_ready(ids.iter().map(String::as_str));

        debug!(
            tasks = scheduler.tasks.len(),
            ready = initially_ready.len(),
            max_workers = scheduler.max_workers,
            "scheduler initialised"
        );

        scheduler
    }

    fn manager(&mut self) -> StateManager<'_> {
        StateManager::new(self.plan.graph(), &mut self.tasks, &mut self.ready)
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.plan.graph().index_of(id).ok_or_else(|| {
            TaskfleetError::InternalConsistency(format!("report for unknown task '{id}'"))
        })
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.running < self.max_workers
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        let i = self.plan.graph().index_of(id)?;
        Some(self.tasks[i].status())
    }

    pub fn retry_record(&self, id: &str) -> Option<&RetryRecord> {
        let i = self.plan.graph().index_of(id)?;
        Some(&self.tasks[i].retry)
    }

    /// Snapshot of the status table, in plan order.
    pub fn snapshot(&self) -> Vec<TaskStatusRecord> {
        self.tasks.iter().map(TaskStatusRecord::from).collect()
    }

    /// Result recorded for a terminal task.
    pub fn result_of(&self, id: &str) -> Option<&TaskResult> {
        let i = self.plan.graph().index_of(id)?;
        self.tasks[i].result.as_ref()
    }

    /// Hand out the next task to run, if a worker slot is free and a task is
    /// ready.
    ///
    /// The chosen task is marked `Running` and its attempt counter advanced.
    pub fn next_dispatch(&mut self) -> Result<Option<Dispatch>> {
        if !self.has_free_slot() {
            return Ok(None);
        }
        let Some(key) = self.ready.pop_first() else {
            return Ok(None);
        };

        let index = key.1;
        if !state_manager::deps_completed(self.plan.graph(), &self.tasks, index) {
            return Err(TaskfleetError::InternalConsistency(format!(
                "task '{}' reached the ready set with unfinished dependencies",
                self.tasks[index].id()
            )));
        }

        let info = &mut self.tasks[index];
        if info.status() != TaskStatus::Ready {
            return Err(TaskfleetError::InternalConsistency(format!(
                "task '{}' in ready set has status {}",
                info.id(),
                info.status()
            )));
        }

        info.task.status = TaskStatus::Running;
        let attempt = info.retry.record_attempt();
        self.running += 1;

        info!(
            task = %info.task.id,
            attempt,
            running = self.running,
            max_workers = self.max_workers,
            "dispatching task"
        );

        Ok(Some(Dispatch {
            task: info.task.clone(),
            attempt,
        }))
    }

    /// Feed a finished attempt back into the scheduler.
    pub fn apply(&mut self, report: AttemptReport, now: Instant) -> Result<SchedulerStep> {
        let index = self.index_of(&report.task_id)?;
        let info = &self.tasks[index];

        if info.status() != TaskStatus::Running {
            return Err(TaskfleetError::InternalConsistency(format!(
                "attempt report for task '{}' which is {}",
                report.task_id,
                info.status()
            )));
        }
        if info.retry.attempts != report.attempt {
            return Err(TaskfleetError::InternalConsistency(format!(
                "attempt report {} for task '{}' but attempt {} is running",
                report.attempt, report.task_id, info.retry.attempts
            )));
        }

        match report.outcome {
            AttemptOutcome::Succeeded { artifacts } => {
                Ok(self.complete(index, artifacts, report.duration, report.worker))
            }
            AttemptOutcome::Failed { error } => {
                Ok(self.fail(index, error, report.duration, report.worker, now))
            }
        }
    }

    /// Record a dispatch that never reached a worker as a failed attempt.
    pub fn dispatch_failed(&mut self, id: &str, error: String, now: Instant) -> Result<SchedulerStep> {
        let index = self.index_of(id)?;
        if self.tasks[index].status() != TaskStatus::Running {
            return Err(TaskfleetError::InternalConsistency(format!(
                "dispatch failure for task '{id}' which is not running"
            )));
        }
        Ok(self.fail(index, error, Duration::ZERO, "unassigned".to_string(), now))
    }

    fn complete(
        &mut self,
        index: usize,
        artifacts: Vec<PathBuf>,
        duration: Duration,
        worker: String,
    ) -> SchedulerStep {
        self.running = self.running.saturating_sub(1);

        let info = &mut self.tasks[index];
        info.task.status = TaskStatus::Completed;
        info.last_error = None;
        info.result = Some(TaskResult {
            task_id: info.task.id.clone(),
            success: true,
            artifacts,
            duration_ms: duration.as_millis() as u64,
            error: None,
            retry: info.retry.clone(),
            worker: Some(worker),
            finished_at: Utc::now(),
        });

        let id = info.task.id.clone();
        info!(
            task = %id,
            attempts = info.retry.attempts,
            duration_ms = duration.as_millis() as u64,
            "task completed"
        );

        let dependents: Vec<TaskId> = self.plan.graph().dependents_of(&id).to_vec();
        let newly_ready = self
            .manager()
            .promote_ready(dependents.iter().map(String::as_str));

        SchedulerStep {
            newly_ready,
            run_finished: self.is_finished(),
            ..SchedulerStep::default()
        }
    }

    fn fail(
        &mut self,
        index: usize,
        error: String,
        duration: Duration,
        worker: String,
        now: Instant,
    ) -> SchedulerStep {
        self.running = self.running.saturating_sub(1);

        let max_retries = self.max_retries;
        let info = &mut self.tasks[index];
        info.last_error = Some(error.clone());

        if self.policy.should_retry(&info.task, &info.retry, max_retries) {
            let delay = self.policy.next_delay(&info.retry);
            info.task.status = TaskStatus::Retrying;
            let not_before = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);
            self.waiting.push(RetryWait { index, not_before });

            warn!(
                task = %info.task.id,
                attempt = info.retry.attempts,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "task attempt failed; retrying after backoff"
            );

            return SchedulerStep {
                retry_in: Some(delay),
                ..SchedulerStep::default()
            };
        }

        info.task.status = TaskStatus::Failed;
        info.result = Some(TaskResult {
            task_id: info.task.id.clone(),
            success: false,
            artifacts: Vec::new(),
            duration_ms: duration.as_millis() as u64,
            error: Some(error.clone()),
            retry: info.retry.clone(),
            worker: Some(worker),
            finished_at: Utc::now(),
        });

        let id = info.task.id.clone();
        warn!(
            task = %id,
            attempts = info.retry.attempts,
            error = %error,
            "task failed permanently; blocking dependents"
        );

        let newly_blocked = self.manager().block_dependents(&id);

        SchedulerStep {
            newly_failed: Some(id),
            newly_blocked,
            run_finished: self.is_finished(),
            ..SchedulerStep::default()
        }
    }

    /// Move retrying tasks whose backoff has elapsed back into the ready set.
    pub fn release_due_retries(&mut self, now: Instant) -> Vec<TaskId> {
        let mut due: Vec<usize> = Vec::new();
        self.waiting.retain(|w| {
            if w.not_before <= now {
                due.push(w.index);
                false
            } else {
                true
            }
        });
        due.sort_unstable();

        let mut released = Vec::with_capacity(due.len());
        for index in due {
            let info = &mut self.tasks[index];
            if info.status() != TaskStatus::Retrying {
                continue;
            }
            info.task.status = TaskStatus::Ready;
            self.ready.insert(ready_key(info));
            debug!(task = %info.task.id, "backoff elapsed; task ready again");
            released.push(info.task.id.clone());
        }
        released
    }

    /// Earliest instant at which a retrying task becomes ready again.
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.waiting.iter().map(|w| w.not_before).min()
    }

    /// Whether every task is `Completed`, `Failed` or `Blocked`.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|info| info.status().is_terminal())
    }

    /// Detect a run that can no longer make progress.
    ///
    /// Nothing running, nothing ready and nothing waiting on a backoff while
    /// some task is still not terminal can only happen if plan validation
    /// let something through; that is fatal.
    pub fn check_progress(&self) -> Result<()> {
        if self.running > 0 || !self.ready.is_empty() || !self.waiting.is_empty() {
            return Ok(());
        }

        let stuck: Vec<&str> = self
            .tasks
            .iter()
            .filter(|info| !info.status().is_terminal())
            .map(|info| info.id())
            .collect();

        if stuck.is_empty() {
            Ok(())
        } else {
            Err(TaskfleetError::InternalConsistency(format!(
                "no task running or ready but {} task(s) not finished: {}",
                stuck.len(),
                stuck.join(", ")
            )))
        }
    }

    /// Consume the scheduler and return the final results.
    pub fn into_outcome(self) -> RunOutcome {
        let statuses = self.snapshot();
        let blocked = self
            .tasks
            .iter()
            .filter(|info| info.status() == TaskStatus::Blocked)
            .map(|info| info.task.id.clone())
            .collect();
        let results = self.tasks.into_iter().filter_map(|info| info.result).collect();

        RunOutcome {
            results,
            statuses,
            blocked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::task::Task;
    use crate::sched::retry::ExponentialBackoff;

    fn task(id: &str, deps: &[&str], priority: i32) -> Task {
        let mut t = Task::new(id, format!("do {id}"));
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t.priority = priority;
        t
    }

    fn scheduler(tasks: Vec<Task>, workers: usize, max_retries: u32) -> Scheduler {
        let plan = ExecutionPlan::from_tasks("req", workers, tasks).unwrap();
        let policy = ExponentialBackoff::new(Duration::from_millis(10), 2.0);
        Scheduler::new(Arc::new(plan), workers, Arc::new(policy), max_retries)
    }

    fn ok(id: &str, attempt: u32) -> AttemptReport {
        AttemptReport {
            task_id: id.to_string(),
            attempt,
            worker: "w0".into(),
            duration: Duration::from_millis(1),
            outcome: AttemptOutcome::Succeeded { artifacts: vec![] },
        }
    }

    fn failed(id: &str, attempt: u32) -> AttemptReport {
        AttemptReport {
            task_id: id.to_string(),
            attempt,
            worker: "w0".into(),
            duration: Duration::from_millis(1),
            outcome: AttemptOutcome::Failed {
                error: "boom".into(),
            },
        }
    }

    fn dispatch_id(s: &mut Scheduler) -> Option<String> {
        s.next_dispatch().unwrap().map(|d| d.task.id)
    }

    #[test]
    fn higher_priority_first_then_plan_order() {
        let mut s = scheduler(
            vec![task("a", &[], 1), task("b", &[], 3), task("c", &[], 3), task("d", &[], 2)],
            1,
            3,
        );
        let now = Instant::now();
        let mut order = Vec::new();
        while let Some(id) = dispatch_id(&mut s) {
            assert_eq!(s.running_count(), 1);
            assert!(dispatch_id(&mut s).is_none(), "only one slot");
            s.apply(ok(&id, 1), now).unwrap();
            order.push(id);
        }
        assert_eq!(order, vec!["b", "c", "d", "a"]);
        assert!(s.is_finished());
    }

    #[test]
    fn dependents_become_ready_only_after_all_deps_complete() {
        let mut s = scheduler(
            vec![task("t1", &[], 0), task("t2", &[], 0), task("t3", &["t1", "t2"], 9)],
            2,
            3,
        );
        let now = Instant::now();
        assert_eq!(dispatch_id(&mut s).as_deref(), Some("t1"));
        assert_eq!(dispatch_id(&mut s).as_deref(), Some("t2"));
        assert_eq!(s.status_of("t3"), Some(TaskStatus::Pending));

        let step = s.apply(ok("t1", 1), now).unwrap();
        assert!(step.newly_ready.is_empty());
        let step = s.apply(ok("t2", 1), now).unwrap();
        assert_eq!(step.newly_ready, vec!["t3"]);
        assert_eq!(dispatch_id(&mut s).as_deref(), Some("t3"));
    }

    #[test]
    fn failing_task_retries_then_blocks_dependents() {
        let mut s = scheduler(
            vec![task("a", &[], 0), task("b", &["a"], 0), task("c", &["b"], 0), task("x", &[], 0)],
            1,
            3,
        );
        let mut now = Instant::now();

        for attempt in 1..=3 {
            let d = s.next_dispatch().unwrap().unwrap();
            assert_eq!((d.task.id.as_str(), d.attempt), ("a", attempt));
            let step = s.apply(failed("a", attempt), now).unwrap();
            if attempt < 3 {
                assert_eq!(s.status_of("a"), Some(TaskStatus::Retrying));
                assert!(step.retry_in.is_some());
                // Unrelated task runs while "a" backs off.
                if attempt == 1 {
                    assert_eq!(dispatch_id(&mut s).as_deref(), Some("x"));
                    s.apply(ok("x", 1), now).unwrap();
                }
                assert!(s.next_dispatch().unwrap().is_none());
                s.check_progress().unwrap();
                now = s.next_retry_due().unwrap();
                assert_eq!(s.release_due_retries(now), vec!["a"]);
            } else {
                assert_eq!(step.newly_failed.as_deref(), Some("a"));
                assert_eq!(step.newly_blocked, vec!["b", "c"]);
                assert!(step.run_finished);
            }
        }

        let outcome = s.into_outcome();
        let a = outcome.result_for("a").unwrap();
        assert!(!a.success);
        assert_eq!(a.retry.attempts, 3);
        assert_eq!(a.error.as_deref(), Some("boom"));
        assert_eq!(outcome.blocked, vec!["b", "c"]);
        assert!(outcome.result_for("b").is_none());
        assert_eq!(outcome.results.len(), 2);
        assert!(!outcome.all_completed());
    }

    #[test]
    fn backoff_grows_between_attempts() {
        let mut s = scheduler(vec![task("a", &[], 0)], 1, 3);
        let now = Instant::now();

        s.next_dispatch().unwrap();
        let first = s.apply(failed("a", 1), now).unwrap().retry_in.unwrap();
        assert!(s.release_due_retries(now).is_empty());
        let due = s.next_retry_due().unwrap();
        s.release_due_retries(due);
        s.next_dispatch().unwrap();
        let second = s.apply(failed("a", 2), due).unwrap().retry_in.unwrap();
        assert_eq!(first, Duration::from_millis(20));
        assert_eq!(second, Duration::from_millis(40));
    }

    #[test]
    fn mismatched_reports_are_consistency_errors() {
        let mut s = scheduler(vec![task("a", &[], 0)], 1, 3);
        let now = Instant::now();
        assert!(matches!(
            s.apply(ok("a", 1), now),
            Err(TaskfleetError::InternalConsistency(_))
        ));
        s.next_dispatch().unwrap();
        assert!(matches!(
            s.apply(ok("a", 2), now),
            Err(TaskfleetError::InternalConsistency(_))
        ));
        assert!(matches!(
            s.apply(ok("ghost", 1), now),
            Err(TaskfleetError::InternalConsistency(_))
        ));
    }

    #[test]
    fn dispatch_failure_counts_as_attempt() {
        let mut s = scheduler(vec![task("a", &[], 0)], 1, 1);
        s.next_dispatch().unwrap();
        let step = s
            .dispatch_failed("a", "no container".into(), Instant::now())
            .unwrap();
        assert_eq!(step.newly_failed.as_deref(), Some("a"));
        assert_eq!(s.retry_record("a").unwrap().attempts, 1);
        assert_eq!(s.result_of("a").unwrap().error.as_deref(), Some("no container"));
    }
}
