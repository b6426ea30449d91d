//! In-memory storage backend for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use sentinel_common::Result;

use crate::backend::Backend;

/// Backend keeping all files in a process-local map.
#[derive(Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored names, including nested ones. Test helper.
    pub async fn names(&self) -> Vec<String> {
        self.files.read().await.keys().cloned().collect()
    }

    /// Replace a stored file's bytes directly, bypassing the backend
    /// contract. Used by tests to simulate on-disk corruption.
    pub async fn corrupt(&self, name: &str, mutate: impl FnOnce(&mut Vec<u8>)) -> bool {
        let mut files = self.files.write().await;
        match files.get_mut(name) {
            Some(data) => {
                mutate(data);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.read().await.get(name).cloned())
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.files
            .write()
            .await
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete_file(&self, name: &str) -> Result<bool> {
        Ok(self.files.write().await.remove(name).is_some())
    }

    async fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .files
            .read()
            .await
            .keys()
            .filter(|name| name.starts_with(prefix) && !name.contains('/'))
            .cloned()
            .collect())
    }
}
