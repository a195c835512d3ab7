// src/store/file.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{Result, TaskfleetError};
use crate::fs::{FileSystem, RealFileSystem};
use crate::store::{StateStore, UpdateFn};
use crate::types::BoxFuture;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_POLL: Duration = Duration::from_millis(25);

/// Directory-backed store, safe to share between processes on one host or
/// across a shared filesystem.
///
/// Writes go to a uniquely named temporary file that is then renamed over
/// the target. Updates hold `<key>.lock`, created exclusively, for the
/// duration of the read-modify-write.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    lock_timeout: Duration,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_fs(root, Arc::new(RealFileSystem))
    }

    pub fn with_fs(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            fs,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of `key`.
    pub fn path_of(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.lock"))
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let target = self.path_of(key);
        let tmp = self.root.join(format!("{key}.tmp-{}", Uuid::new_v4().simple()));
        self.fs.write(&tmp, bytes)?;
        if let Err(e) = self.fs.rename(&tmp, &target) {
            let _ = self.fs.remove(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    async fn acquire(&self, key: &str) -> Result<FileLock<'_>> {
        let path = self.lock_path(key);
        let owner = format!("{}:{}", std::process::id(), Uuid::new_v4().simple());
        let deadline = tokio::time::Instant::now() + self.lock_timeout;

        loop {
            if self.fs.create_exclusive(&path, owner.as_bytes())? {
                return Ok(FileLock {
                    fs: self.fs.as_ref(),
                    path,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(lock = ?path, "gave up waiting for state lock");
                return Err(TaskfleetError::Backend(format!(
                    "timed out after {}s waiting for lock {:?}",
                    self.lock_timeout.as_secs(),
                    path
                )));
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }
}

/// Held update lock; released on drop.
struct FileLock<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.fs.remove(&self.path) {
            warn!(lock = ?self.path, error = %e, "failed to release state lock");
        }
    }
}

impl StateStore for FileStore {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn ensure_ready(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.fs.create_dir_all(&self.root).map_err(|e| {
                TaskfleetError::Initialization(format!(
                    "state directory {:?} is not usable: {e}",
                    self.root
                ))
            })?;
            debug!(root = ?self.root, "file state store ready");
            Ok(())
        })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.fs.read(&self.path_of(key))?) })
    }

    fn write<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write_atomic(key, &bytes) })
    }

    fn update<'a>(&'a self, key: &'a str, f: UpdateFn) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let _lock = self.acquire(key).await?;
            let current = self.fs.read(&self.path_of(key))?;
            let next = f(current)?;
            self.write_atomic(key, &next)?;
            Ok(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn append(byte: u8) -> UpdateFn {
        Box::new(move |cur| {
            let mut v = cur.unwrap_or_default();
            v.push(byte);
            Ok(v)
        })
    }

    #[tokio::test]
    async fn writes_are_renamed_into_place() {
        let fs = MockFileSystem::new();
        let store = FileStore::with_fs("/state", Arc::new(fs.clone()));
        store.ensure_ready().await.unwrap();

        store.write("results/t1.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(fs.paths(), vec![PathBuf::from("/state/results/t1.json")]);
        assert_eq!(store.read("results/t1.json").await.unwrap().unwrap(), b"{}");
    }

    #[tokio::test]
    async fn update_releases_lock_even_on_error() {
        let fs = MockFileSystem::new();
        let store = FileStore::with_fs("/state", Arc::new(fs.clone()));

        store.update("jobs.json", append(b'a')).await.unwrap();
        let err = store
            .update("jobs.json", Box::new(|_| Err(TaskfleetError::Backend("bad".into()))))
            .await;
        assert!(err.is_err());
        store.update("jobs.json", append(b'b')).await.unwrap();

        assert_eq!(store.read("jobs.json").await.unwrap().unwrap(), b"ab");
        assert!(!fs.exists(Path::new("/state/jobs.json.lock")));
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let fs = MockFileSystem::new();
        fs.add_file("/state/jobs.json.lock", "someone else");
        let store = FileStore::with_fs("/state", Arc::new(fs))
            .with_lock_timeout(Duration::from_millis(60));

        let err = store.update("jobs.json", append(b'x')).await.unwrap_err();
        assert!(matches!(err, TaskfleetError::Backend(msg) if msg.contains("waiting for lock")));
    }

    #[tokio::test]
    async fn concurrent_updates_on_disk_do_not_lose_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(tmp.path()));
        store.ensure_ready().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    store.update("counter", append(b'.')).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.read("counter").await.unwrap().unwrap().len(), 40);
    }
}
