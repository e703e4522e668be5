//! Snapshot cache providers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use skiff_store_core::ObjectStore;

/// One possible source of a saved projection state.
#[async_trait]
pub trait SnapshotCandidate: Send + Sync {
    /// Where this candidate comes from, for logs.
    fn label(&self) -> &str;

    /// Read the candidate's bytes.
    async fn read(&self) -> anyhow::Result<Vec<u8>>;
}

/// A store of named snapshots, yielding read candidates newest first.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Candidates for `name`, newest first, opened lazily.
    async fn open_read(&self, name: &str) -> anyhow::Result<Vec<Box<dyn SnapshotCandidate>>>;

    /// Write a new snapshot under `name`. `Ok(false)` means the store
    /// declined (e.g. read-only mirrors); errors mean it tried and failed.
    async fn try_write(&self, name: &str, bytes: &[u8]) -> anyhow::Result<bool>;
}

//─────────────────────────────
//  In-memory store
//─────────────────────────────

/// Non-persistent snapshot store for tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    versions: Arc<Mutex<HashMap<String, Vec<Arc<Vec<u8>>>>>>,
}

struct MemoryCandidate {
    label: String,
    bytes: Arc<Vec<u8>>,
}

#[async_trait]
impl SnapshotCandidate for MemoryCandidate {
    fn label(&self) -> &str {
        &self.label
    }

    async fn read(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.bytes.as_ref().clone())
    }
}

impl MemorySnapshotStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of versions stored under `name`. Test helper.
    pub async fn version_count(&self, name: &str) -> usize {
        self.versions.lock().await.get(name).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn open_read(&self, name: &str) -> anyhow::Result<Vec<Box<dyn SnapshotCandidate>>> {
        let versions = self.versions.lock().await;
        let Some(entries) = versions.get(name) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .enumerate()
            .rev()
            .map(|(i, bytes)| {
                Box::new(MemoryCandidate {
                    label: format!("memory:{name}#{i}"),
                    bytes: Arc::clone(bytes),
                }) as Box<dyn SnapshotCandidate>
            })
            .collect())
    }

    async fn try_write(&self, name: &str, bytes: &[u8]) -> anyhow::Result<bool> {
        self.versions
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(bytes.to_vec()));
        Ok(true)
    }
}

//─────────────────────────────
//  Directory store
//─────────────────────────────

/// One snapshot file per name inside a directory; writes go through a
/// temp-then-rename so readers never observe a partial file.
#[derive(Debug, Clone)]
pub struct DirectorySnapshotStore {
    root: PathBuf,
}

struct FileCandidate {
    label: String,
    path: PathBuf,
}

#[async_trait]
impl SnapshotCandidate for FileCandidate {
    fn label(&self) -> &str {
        &self.label
    }

    async fn read(&self) -> anyhow::Result<Vec<u8>> {
        Ok(fs::read(&self.path).await?)
    }
}

impl DirectorySnapshotStore {
    /// Open (creating if needed) the snapshot directory.
    pub async fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl SnapshotStore for DirectorySnapshotStore {
    async fn open_read(&self, name: &str) -> anyhow::Result<Vec<Box<dyn SnapshotCandidate>>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(vec![Box::new(FileCandidate {
            label: format!("file:{}", path.display()),
            path,
        })])
    }

    async fn try_write(&self, name: &str, bytes: &[u8]) -> anyhow::Result<bool> {
        let path = self.path_for(name);
        let temp = self.root.join(format!("{name}.tmp"));
        if let Err(error) = fs::write(&temp, bytes).await {
            let _ = fs::remove_file(&temp).await;
            return Err(error.into());
        }
        fs::rename(&temp, &path).await?;
        debug!(name, len = bytes.len(), "wrote snapshot file");
        Ok(true)
    }
}

//─────────────────────────────
//  Versioned object-store provider
//─────────────────────────────

/// Default retention for [`VersionedSnapshotStore`].
pub const MAX_CACHE_BLOBS: usize = 100;

/// Snapshots as `name/YYYYMMDDHHMMSS` objects, newest first on read, pruned
/// oldest-first once a name holds more than `max_blobs` versions.
pub struct VersionedSnapshotStore<S> {
    store: Arc<S>,
    max_blobs: usize,
}

struct ObjectCandidate<S> {
    store: Arc<S>,
    name: String,
    len: u64,
}

#[async_trait]
impl<S: ObjectStore> SnapshotCandidate for ObjectCandidate<S> {
    fn label(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = self.store.read_range(&self.name, 0, self.len as usize).await?;
        Ok(bytes.to_vec())
    }
}

impl<S: ObjectStore> VersionedSnapshotStore<S> {
    /// Wrap `store` with the default retention.
    pub fn new(store: S) -> Self {
        Self::with_retention(store, MAX_CACHE_BLOBS)
    }

    /// Wrap `store`, keeping at most `max_blobs` versions per name.
    pub fn with_retention(store: S, max_blobs: usize) -> Self {
        Self { store: Arc::new(store), max_blobs: max_blobs.max(1) }
    }

    /// Version object names under `name`, oldest first.
    async fn versions(&self, name: &str) -> anyhow::Result<Vec<(String, u64)>> {
        let prefix = format!("{name}/");
        let mut versions: Vec<(String, u64)> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|meta| meta.name.starts_with(&prefix))
            .map(|meta| (meta.name, meta.len))
            .collect();
        versions.sort();
        Ok(versions)
    }
}

#[async_trait]
impl<S: ObjectStore> SnapshotStore for VersionedSnapshotStore<S> {
    async fn open_read(&self, name: &str) -> anyhow::Result<Vec<Box<dyn SnapshotCandidate>>> {
        let versions = self.versions(name).await?;
        Ok(versions
            .into_iter()
            .rev()
            .map(|(name, len)| {
                Box::new(ObjectCandidate { store: Arc::clone(&self.store), name, len })
                    as Box<dyn SnapshotCandidate>
            })
            .collect())
    }

    async fn try_write(&self, name: &str, bytes: &[u8]) -> anyhow::Result<bool> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let mut object = format!("{name}/{stamp}");
        // Two saves within a second would collide; suffix until free.
        let mut attempt = 0;
        while self.store.len(&object).await?.is_some() {
            attempt += 1;
            object = format!("{name}/{stamp}-{attempt}");
        }
        self.store.create(&object).await?;
        let appended = self.store.append(&object, 0, bytes).await?;
        if !appended.accepted {
            anyhow::bail!("snapshot object {object:?} was written concurrently");
        }

        let versions = self.versions(name).await?;
        if versions.len() > self.max_blobs {
            for (stale, _) in &versions[..versions.len() - self.max_blobs] {
                debug!(object = %stale, "pruning old snapshot version");
                self.store.delete(stale).await?;
            }
        }
        Ok(true)
    }
}

//─────────────────────────────
//  Local mirror with remote fallback
//─────────────────────────────

/// Reads prefer a local directory mirror and fall back to the remote store;
/// writes land remotely and are mirrored locally best-effort.
pub struct MirroredSnapshotStore {
    local: DirectorySnapshotStore,
    remote: Arc<dyn SnapshotStore>,
}

impl MirroredSnapshotStore {
    /// Mirror `remote` under the local directory `root`.
    pub async fn open(
        root: impl AsRef<Path>,
        remote: Arc<dyn SnapshotStore>,
    ) -> anyhow::Result<Self> {
        Ok(Self { local: DirectorySnapshotStore::open(root).await?, remote })
    }
}

#[async_trait]
impl SnapshotStore for MirroredSnapshotStore {
    async fn open_read(&self, name: &str) -> anyhow::Result<Vec<Box<dyn SnapshotCandidate>>> {
        let mut candidates = self.local.open_read(name).await?;
        candidates.extend(self.remote.open_read(name).await?);
        Ok(candidates)
    }

    async fn try_write(&self, name: &str, bytes: &[u8]) -> anyhow::Result<bool> {
        let written = self.remote.try_write(name, bytes).await?;
        if let Err(error) = self.local.try_write(name, bytes).await {
            warn!(name, %error, "local snapshot mirror failed");
        }
        Ok(written)
    }
}
