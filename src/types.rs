use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Boxed, sendable future used at every async trait seam in the crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Which execution substrate runs the workers.
///
/// The set is closed: a backend is picked once at startup from configuration
/// and never changes for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process workers (tokio tasks) with in-memory state.
    Threading,
    /// One local Docker container per task attempt, state on a mounted directory.
    Docker,
    /// SLURM batch jobs with state on a shared filesystem.
    Slurm,
    /// SLURM on a cloud cluster with state in object storage.
    ParallelCluster,
    /// AWS Batch jobs with state in object storage.
    Batch,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Threading
    }
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Threading => "threading",
            BackendKind::Docker => "docker",
            BackendKind::Slurm => "slurm",
            BackendKind::ParallelCluster => "parallel-cluster",
            BackendKind::Batch => "batch",
        }
    }

    /// Whether this backend keeps its state in object storage.
    pub fn uses_object_storage(self) -> bool {
        matches!(self, BackendKind::ParallelCluster | BackendKind::Batch)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "threading" | "threads" => Ok(BackendKind::Threading),
            "docker" => Ok(BackendKind::Docker),
            "slurm" => Ok(BackendKind::Slurm),
            "parallel-cluster" | "aws" => Ok(BackendKind::ParallelCluster),
            "batch" => Ok(BackendKind::Batch),
            other => Err(format!(
                "invalid backend: {other} (expected threading, docker, slurm, parallel-cluster or batch)"
            )),
        }
    }
}

/// Which planning collaborator turns requirements into a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PlannerKind {
    /// Deterministic clause splitter; needs no external service.
    Heuristic,
    /// Ask the LLM CLI for a JSON plan.
    Llm,
}

impl Default for PlannerKind {
    fn default() -> Self {
        PlannerKind::Heuristic
    }
}

/// Parse a duration string such as `"500ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' missing unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration(" 2m "), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn backend_names_round_trip_through_from_str() {
        for kind in [
            BackendKind::Threading,
            BackendKind::Docker,
            BackendKind::Slurm,
            BackendKind::ParallelCluster,
            BackendKind::Batch,
        ] {
            assert_eq!(kind.as_str().parse::<BackendKind>(), Ok(kind));
        }
        assert_eq!("aws".parse::<BackendKind>(), Ok(BackendKind::ParallelCluster));
        assert!("kubernetes".parse::<BackendKind>().is_err());
    }
}
