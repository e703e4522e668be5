//! In-memory object store, used by driver and compaction tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use skiff_store_core::{ObjectAppend, ObjectMeta, ObjectStore, Result, StoreError};

/// A container of named byte buffers behind one lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names currently present, sorted. Test helper.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn missing(name: &str) -> StoreError {
    StoreError::Backend(anyhow::anyhow!("object {name:?} does not exist"))
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.lock().await;
        Ok(objects
            .iter()
            .map(|(name, data)| ObjectMeta { name: name.clone(), len: data.len() as u64 })
            .collect())
    }

    async fn len(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.objects.lock().await.get(name).map(|d| d.len() as u64))
    }

    async fn read_range(&self, name: &str, offset: u64, limit: usize) -> Result<Bytes> {
        let objects = self.objects.lock().await;
        let data = objects.get(name).ok_or_else(|| missing(name))?;
        let start = (offset as usize).min(data.len());
        let end = (start + limit).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> Result<ObjectAppend> {
        let mut objects = self.objects.lock().await;
        let current = objects.get(name).map(|d| d.len() as u64).unwrap_or(0);
        if current != expected_len {
            return Ok(ObjectAppend { accepted: false, new_len: current });
        }
        let buf = objects.entry(name.to_string()).or_default();
        buf.extend_from_slice(data);
        Ok(ObjectAppend { accepted: true, new_len: buf.len() as u64 })
    }

    async fn create(&self, name: &str) -> Result<()> {
        self.objects.lock().await.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects.lock().await.remove(name);
        Ok(())
    }

    async fn publish(&self, staged: &str, name: &str) -> Result<()> {
        let mut objects = self.objects.lock().await;
        let data = objects.remove(staged).ok_or_else(|| missing(staged))?;
        objects.insert(name.to_string(), data);
        Ok(())
    }
}
