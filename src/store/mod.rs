// src/store/mod.rs

//! Durable state shared between the orchestrator and its workers.
//!
//! Every backend persists the same records through a [`StateStore`]:
//!
//! ```text
//! task_definitions/<task>.json        what a worker should run
//! tasks.json                          status table (one row per task)
//! jobs.json                           job id <-> task id, attempt, phase
//! reports/<task>.attempt-<n>.json     written by the worker of attempt n
//! results/<task>.json                 final result of a terminal task
//! ```
//!
//! Stores differ only in their medium: process memory, a (shared) directory
//! or an object-storage bucket.

use std::fmt::{self, Debug};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{Result, TaskfleetError};
use crate::exec::command::CommandRunner;
use crate::types::BoxFuture;

pub mod file;
pub mod memory;
pub mod object;
pub mod records;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use object::{ObjectStore, ObjectStoreSettings};
pub use records::{JobPhase, JobRecord, TaskDefinition, WorkerReport};

/// Read-modify-write callback for [`StateStore::update`].
pub type UpdateFn = Box<dyn FnOnce(Option<Vec<u8>>) -> Result<Vec<u8>> + Send>;

/// Key-value store with an atomic update primitive.
pub trait StateStore: Send + Sync + Debug {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Verify the medium is reachable and prepare it for use.
    fn ensure_ready(&self) -> BoxFuture<'_, Result<()>>;

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    fn write<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Atomically replace the value at `key` with `f(current)`.
    ///
    /// Concurrent updates from other processes sharing the medium are
    /// serialized. Returns the value that was written.
    fn update<'a>(&'a self, key: &'a str, f: UpdateFn) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Well-known keys.
pub mod keys {
    pub const TASKS: &str = "tasks.json";
    pub const JOBS: &str = "jobs.json";

    pub fn task_definition(task: &str) -> String {
        format!("task_definitions/{task}.json")
    }

    pub fn report(task: &str, attempt: u32) -> String {
        format!("reports/{task}.attempt-{attempt}.json")
    }

    pub fn result(task: &str) -> String {
        format!("results/{task}.json")
    }

    pub fn output(task: &str, relative: &str) -> String {
        format!("outputs/{task}/{relative}")
    }
}

pub async fn read_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.read(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn write_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.write(key, bytes).await
}

/// Insert or replace a row of the job table under the store's update lock.
pub async fn upsert_job(store: &dyn StateStore, record: JobRecord) -> Result<()> {
    store
        .update(
            keys::JOBS,
            Box::new(move |current| {
                let mut jobs: Vec<JobRecord> = match current {
                    Some(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
                    _ => Vec::new(),
                };
                match jobs
                    .iter_mut()
                    .find(|j| j.task_id == record.task_id && j.attempt == record.attempt)
                {
                    Some(existing) => existing.merge(record),
                    None => jobs.push(record),
                }
                Ok(serde_json::to_vec_pretty(&jobs)?)
            }),
        )
        .await
        .map(|_| ())
}

/// Where a store lives; parsed from `--state` arguments and built from
/// backend configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum StateLocation {
    Memory,
    Directory(PathBuf),
    Bucket(ObjectStoreSettings),
}

impl StateLocation {
    /// `s3://bucket/prefix` selects object storage; anything else is a
    /// directory path.
    pub fn parse(raw: &str, region: Option<&str>) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TaskfleetError::ConfigError("empty state location".to_string()));
        }
        if let Some(rest) = raw.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(TaskfleetError::ConfigError(format!(
                    "state location '{raw}' has no bucket"
                )));
            }
            return Ok(StateLocation::Bucket(ObjectStoreSettings {
                bucket: bucket.to_string(),
                prefix: prefix.trim_matches('/').to_string(),
                region: region.map(str::to_string),
            }));
        }
        Ok(StateLocation::Directory(PathBuf::from(raw)))
    }

    pub fn open(&self, runner: Arc<dyn CommandRunner>) -> Arc<dyn StateStore> {
        match self {
            StateLocation::Memory => Arc::new(MemoryStore::new()),
            StateLocation::Directory(dir) => Arc::new(FileStore::new(dir.clone())),
            StateLocation::Bucket(settings) => Arc::new(ObjectStore::new(settings.clone(), runner)),
        }
    }
}

impl fmt::Display for StateLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateLocation::Memory => f.write_str("memory"),
            StateLocation::Directory(dir) => write!(f, "{}", dir.display()),
            StateLocation::Bucket(s) => f.write_str(&s.url("")),
        }
    }
}
