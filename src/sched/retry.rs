// src/sched/retry.rs

//! Retry policy: whether a failed task gets another attempt, and when.

use std::fmt::Debug;
use std::time::Duration;

use crate::plan::task::{RetryRecord, Task};

pub trait RetryPolicy: Send + Sync + Debug {
    /// Whether `task` should be attempted again after a failure.
    ///
    /// `record.attempts` counts attempts already started, including the one
    /// that just failed.
    fn should_retry(&self, task: &Task, record: &RetryRecord, max_retries: u32) -> bool;

    /// How long to wait before the next attempt.
    fn next_delay(&self, record: &RetryRecord) -> Duration;
}

/// `delay = base * multiplier^attempts`, optionally capped.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: None,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64) -> Self {
        Self {
            base,
            multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max: Option<Duration>) -> Self {
        self.max_delay = max;
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, _task: &Task, record: &RetryRecord, max_retries: u32) -> bool {
        record.attempts < max_retries
    }

    fn next_delay(&self, record: &RetryRecord) -> Duration {
        let factor = self.multiplier.max(0.0).powi(record.attempts.min(i32::MAX as u32) as i32);
        let secs = self.base.as_secs_f64() * factor;

        let delay = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(attempts: u32) -> RetryRecord {
        RetryRecord {
            attempts,
            last_attempt: None,
        }
    }

    #[test]
    fn retries_until_attempts_reach_max() {
        let policy = ExponentialBackoff::default();
        let task = Task::new("t", "x");
        assert!(policy.should_retry(&task, &record(1), 3));
        assert!(policy.should_retry(&task, &record(2), 3));
        assert!(!policy.should_retry(&task, &record(3), 3));
        assert!(!policy.should_retry(&task, &record(1), 1));
    }

    #[test]
    fn delay_grows_exponentially_and_respects_cap() {
        let policy = ExponentialBackoff::new(Duration::from_secs(5), 2.0);
        assert_eq!(policy.next_delay(&record(0)), Duration::from_secs(5));
        assert_eq!(policy.next_delay(&record(1)), Duration::from_secs(10));
        assert_eq!(policy.next_delay(&record(3)), Duration::from_secs(40));

        let capped = policy.with_max_delay(Some(Duration::from_secs(15)));
        assert_eq!(capped.next_delay(&record(3)), Duration::from_secs(15));
    }

    #[test]
    fn huge_exponents_saturate() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(&record(10_000)), Duration::MAX);
    }
}
