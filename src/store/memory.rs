// src/store/memory.rs

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::errors::{Result, TaskfleetError};
use crate::store::{StateStore, UpdateFn};
use crate::types::BoxFuture;

/// Process-local store guarded by a single mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| TaskfleetError::InternalConsistency("memory store lock poisoned".to_string()))
    }

    /// Keys currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

impl StateStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn ensure_ready(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn read<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.entries()?.get(key).cloned()) })
    }

    fn write<'a>(&'a self, key: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries()?.insert(key.to_string(), bytes);
            Ok(())
        })
    }

    fn update<'a>(&'a self, key: &'a str, f: UpdateFn) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            // The guard is held across the callback, never across an await.
            let mut entries = self.entries()?;
            let next = f(entries.get(key).cloned())?;
            entries.insert(key.to_string(), next.clone());
            Ok(next)
        })
    }
}
