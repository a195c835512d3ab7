// src/fs/mock.rs

use super::FileSystem;
use anyhow::{Result, anyhow};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    /// Paths whose writes fail, for error-path tests.
    failing: BTreeSet<PathBuf>,
}

/// In-memory filesystem for tests. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MockFileSystem {
    state: Arc<Mutex<MockState>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("mock filesystem lock poisoned"))
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.lock() {
            let path = path.as_ref().to_path_buf();
            add_parents(&mut state, &path);
            state.files.insert(path, content.into());
        }
    }

    /// Make every write to `path` fail.
    pub fn fail_writes_to(&self, path: impl AsRef<Path>) {
        if let Ok(mut state) = self.lock() {
            state.failing.insert(path.as_ref().to_path_buf());
        }
    }

    /// All file paths currently stored, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock()
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

fn add_parents(state: &mut MockState, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir.as_os_str().is_empty() || !state.dirs.insert(dir.to_path_buf()) {
            break;
        }
        current = dir.parent();
    }
}

fn check_writable(state: &MockState, path: &Path) -> Result<()> {
    if state.failing.contains(path) {
        return Err(anyhow!("simulated write failure: {:?}", path));
    }
    if state.dirs.contains(path) {
        return Err(anyhow!("Is a directory: {:?}", path));
    }
    Ok(())
}

impl FileSystem for MockFileSystem {
    fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        let state = self.lock()?;
        if state.dirs.contains(path) {
            return Err(anyhow!("Is a directory: {:?}", path));
        }
        Ok(state.files.get(path).cloned())
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        check_writable(&state, path)?;
        add_parents(&mut state, path);
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn create_exclusive(&self, path: &Path, contents: &[u8]) -> Result<bool> {
        let mut state = self.lock()?;
        check_writable(&state, path)?;
        if state.files.contains_key(path) {
            return Ok(false);
        }
        add_parents(&mut state, path);
        state.files.insert(path.to_path_buf(), contents.to_vec());
        Ok(true)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut state = self.lock()?;
        check_writable(&state, to)?;
        let contents = state
            .files
            .remove(from)
            .ok_or_else(|| anyhow!("File not found: {:?}", from))?;
        add_parents(&mut state, to);
        state.files.insert(to.to_path_buf(), contents);
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut state = self.lock()?;
        state.files.remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.lock()
            .map(|s| s.files.contains_key(path) || s.dirs.contains(path))
            .unwrap_or(false)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.lock()?;
        if state.files.contains_key(path) {
            return Err(anyhow!("File exists: {:?}", path));
        }
        state.dirs.insert(path.to_path_buf());
        add_parents(&mut state, path);
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.lock()?;
        if !state.dirs.contains(path) {
            return Err(anyhow!("Not a directory or not found: {:?}", path));
        }
        let children = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect::<BTreeSet<_>>();
        Ok(children.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_tracks_files_and_directories() {
        let fs = MockFileSystem::new();
        fs.write(Path::new("/state/tasks.json"), b"[]").unwrap();
        fs.add_file("/state/results/a.json", "{}");

        assert!(fs.exists(Path::new("/state/results")));
        assert_eq!(
            fs.read_dir(Path::new("/state")).unwrap(),
            vec![PathBuf::from("/state/results"), PathBuf::from("/state/tasks.json")]
        );
        assert!(fs.read(Path::new("/state")).is_err());
        assert_eq!(fs.read(Path::new("/state/nope")).unwrap(), None);
    }

    #[test]
    fn exclusive_create_and_injected_failures() {
        let fs = MockFileSystem::new();
        let lock = Path::new("/s/.lock");
        assert!(fs.create_exclusive(lock, b"").unwrap());
        assert!(!fs.create_exclusive(lock, b"").unwrap());

        fs.fail_writes_to("/s/broken.json");
        assert!(fs.write(Path::new("/s/broken.json"), b"x").is_err());
    }
}
