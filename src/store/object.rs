// src/store/object.rs

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{Result, TaskfleetError};
use crate::exec::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::store::{StateStore, UpdateFn};
use crate::types::BoxFuture;

const LOCK_TIMEOUT: Duration = Duration::from_secs(60);
const LOCK_POLL: Duration = Duration::from_millis(500);

/// Bucket coordinates for an [`ObjectStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    /// Key prefix without leading or trailing slashes; may be empty.
    pub prefix: String,
    pub region: Option<String>,
}

impl ObjectStoreSettings {
    pub fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    pub fn url(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            format!("s3://{}/{}", self.bucket, key)
        } else {
            format!("s3://{}/{}/{}", self.bucket, self.prefix, key)
        }
    }
}

/// S3-backed store driven through the `aws` CLI.
///
/// Updates take a lock object created with a conditional put
/// (`If-None-Match: *`), which S3 rejects if the object already exists.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    settings: ObjectStoreSettings,
    runner: Arc<dyn CommandRunner>,
    lock_timeout: Duration,
}

impl ObjectStore {
    pub fn new(settings: ObjectStoreSettings, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            settings,
            runner,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn settings(&self) -> &ObjectStoreSettings {
        &self.settings
    }

    fn aws(&self) -> CommandSpec {
        let spec = CommandSpec::new("aws");
        match self.settings.region {
            Some(ref region) => spec.args(["--region", region.as_str()]),
            None => spec,
        }
    }

    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.runner.run(spec).await
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let spec = self
            .aws()
            .args(["s3", "cp", "-", self.settings.url(key).as_str()])
            .stdin(bytes);
        let out = self.run(spec).await?;
        if !out.success() {
            return Err(TaskfleetError::Backend(format!(
                "uploading {} failed: {}",
                self.settings.url(key),
                out.diagnostic()
            )));
        }
        Ok(())
    }

    /// Objects are downloaded to a scratch file since captured stdout is text.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let scratch = std::env::temp_dir().join(format!("taskfleet-{}.object", Uuid::new_v4()));
        let spec = self.aws().args([
            "s3",
            "cp",
            self.settings.url(key).as_str(),
            scratch.to_string_lossy().as_ref(),
        ]);
        let out = self.run(spec).await?;
        if !out.success() {
            if is_not_found(&out) {
                return Ok(None);
            }
            return Err(TaskfleetError::Backend(format!(
                "downloading {} failed: {}",
                self.settings.url(key),
                out.diagnostic()
            )));
        }

        let bytes = tokio::fs::read(&scratch).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            debug!(path = %scratch.display(), error = %e, "could not remove download scratch file");
        }
        Ok(Some(bytes?))
    }

    async fn try_lock(&self, lock_key: &str, owner: &str) -> Result<bool> {
        let object_key = self.settings.object_key(lock_key);
        let metadata = format!("owner={owner}");
        let spec = self.aws().args([
            "s3api",
            "put-object",
            "--bucket",
            self.settings.bucket.as_str(),
            "--key",
            object_key.as_str(),
            "--if-none-match",
            "*",
            "--metadata",
            metadata.as_str(),
        ]);
        let out = self.run(spec).await?;
        if out.success() {
            return Ok(true);
        }
        let diag = out.diagnostic();
        if diag.contains("PreconditionFailed") || diag.contains("ConditionalRequestConflict") {
            return Ok(false);
        }
        Err(TaskfleetError::Backend(format!(
            "creating lock {} failed: {diag}",
            self.settings.url(lock_key)
        )))
    }

    async fn unlock(&self, lock_key: &str) {
        let spec = self
            .aws()
            .args(["s3", "rm", self.settings.url(lock_key).as_str()]);
        match self.run(spec).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(lock = %lock_key, error = %out.diagnostic(), "failed to release lock object"),
            Err(e) => warn!(lock = %lock_key, error = %e, "failed to release lock object"),
        }
    }
}

fn is_not_found(out: &CommandOutput) -> bool {
    let diag = out.diagnostic();
    diag.contains("404") || diag.contains("Not Found") || diag.contains("NoSuchKey")
}

impl StateStore for ObjectStore {
    fn describe(&self) -> String {
        self.settings.url("")
    }

    fn ensure_ready(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.runner.locate("aws") {
                return Err(TaskfleetError::Initialization(
                    "aws CLI not found on PATH".to_string(),
                ));
            }
            let spec = self
                .aws()
                .args(["s3api", "head-bucket", "--bucket", self.settings.bucket.as_str()]);
            let out = self.run(spec).await.map_err(|e| {
                TaskfleetError::Initialization(format!("checking bucket failed: {e}"))
            })?;
            if !out.success() {
                return Err(TaskfleetError::Initialization(format!(
                    "bucket '{}' is not reachable: {}",
                    self.settings.bucket,
                    out.diagnostic()
                )));
            }
            debug!(bucket = %self.settings.bucket, "object state store ready");
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(self.get(key))
    }

    fn write<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.put(key, bytes))
    }

    fn update<'a>(&'a self, key: &'a str, f: UpdateFn) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let lock_key = format!("{key}.lock");
            let owner = Uuid::new_v4().simple().to_string();
            let deadline = tokio::time::Instant::now() + self.lock_timeout;

            while !self.try_lock(&lock_key, &owner).await? {
                if tokio::time::Instant::now() >= deadline {
                    return Err(TaskfleetError::Backend(format!(
                        "timed out waiting for lock {}",
                        self.settings.url(&lock_key)
                    )));
                }
                tokio::time::sleep(LOCK_POLL).await;
            }

            let result = async {
                let current = self.get(key).await?;
                let next = f(current)?;
                self.put(key, next.clone()).await?;
                Ok::<_, TaskfleetError>(next)
            }
            .await;

            self.unlock(&lock_key).await;
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_and_keys_respect_prefix() {
        let s = ObjectStoreSettings {
            bucket: "b".into(),
            prefix: "runs/1".into(),
            region: None,
        };
        assert_eq!(s.url("tasks.json"), "s3://b/runs/1/tasks.json");
        assert_eq!(s.object_key("jobs.json.lock"), "runs/1/jobs.json.lock");

        let bare = ObjectStoreSettings {
            prefix: String::new(),
            ..s
        };
        assert_eq!(bare.url("tasks.json"), "s3://b/tasks.json");
    }

    #[test]
    fn not_found_detection() {
        let out = CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: "fatal error: An error occurred (404) when calling the HeadObject operation: Not Found".into(),
        };
        assert!(is_not_found(&out));
        let out = CommandOutput {
            code: 1,
            stdout: String::new(),
            stderr: "AccessDenied".into(),
        };
        assert!(!is_not_found(&out));
    }
}
