//! Local write-through read cache for sealed blobs.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::RwLock as StdRwLock;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use skiff_store_core::{ObjectAppend, ObjectMeta, ObjectStore, Result};

const DOWNLOAD_CHUNK: usize = 4 * 1024 * 1024;

/// Object-store decorator that mirrors sealed objects into a local
/// directory on first read and serves repeat reads from disk.
///
/// Only objects flagged through [`ObjectStore::hint_sealed`] are mirrored;
/// the active blob keeps growing and always reads through. The cache is
/// never used for writes. A mirror whose length disagrees with the remote
/// object is discarded and refetched.
pub struct CachedStore<S> {
    inner: S,
    dir: PathBuf,
    sealed: StdRwLock<HashSet<String>>,
}

impl<S: ObjectStore> CachedStore<S> {
    /// Wrap `inner`, mirroring sealed objects under `dir`.
    pub async fn open(inner: S, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { inner, dir, sealed: StdRwLock::new(HashSet::new()) })
    }

    fn local_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn is_sealed(&self, name: &str) -> bool {
        self.sealed.read().expect("sealed set poisoned").contains(name)
    }

    /// Make sure the local mirror of `name` matches the remote object,
    /// downloading it when missing or stale. Returns `None` when the remote
    /// object is gone.
    async fn ensure_mirror(&self, name: &str) -> Result<Option<PathBuf>> {
        let Some(remote_len) = self.inner.len(name).await? else {
            return Ok(None);
        };
        let path = self.local_path(name);
        match fs::metadata(&path).await {
            Ok(meta) if meta.len() == remote_len => return Ok(Some(path)),
            Ok(meta) => {
                warn!(name, local = meta.len(), remote = remote_len, "discarding stale mirror");
                fs::remove_file(&path).await?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // Fill a temp file first so a failed download never exposes a
        // partial mirror.
        let temp = self.dir.join(format!("{name}.download"));
        let fetched = self.download(name, remote_len, &temp).await;
        if let Err(err) = fetched {
            let _ = fs::remove_file(&temp).await;
            return Err(err);
        }
        fs::rename(&temp, &path).await?;
        debug!(name, len = remote_len, "mirrored sealed blob");
        Ok(Some(path))
    }

    async fn download(&self, name: &str, remote_len: u64, temp: &Path) -> Result<()> {
        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp)
            .await?;
        let mut offset = 0u64;
        while offset < remote_len {
            let chunk = self.inner.read_range(name, offset, DOWNLOAD_CHUNK).await?;
            if chunk.is_empty() {
                break;
            }
            out.write_all(&chunk).await?;
            offset += chunk.len() as u64;
        }
        out.sync_data().await?;
        Ok(())
    }

    async fn read_local(&self, path: &Path, offset: u64, limit: usize) -> Result<Bytes> {
        let mut file = File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; limit];
        let mut filled = 0;
        while filled < limit {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for CachedStore<S> {
    async fn list(&self) -> Result<Vec<ObjectMeta>> {
        self.inner.list().await
    }

    async fn len(&self, name: &str) -> Result<Option<u64>> {
        self.inner.len(name).await
    }

    async fn read_range(&self, name: &str, offset: u64, limit: usize) -> Result<Bytes> {
        if self.is_sealed(name) {
            if let Some(path) = self.ensure_mirror(name).await? {
                return self.read_local(&path, offset, limit).await;
            }
        }
        self.inner.read_range(name, offset, limit).await
    }

    async fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> Result<ObjectAppend> {
        self.inner.append(name, expected_len, data).await
    }

    async fn create(&self, name: &str) -> Result<()> {
        self.inner.create(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let _ = fs::remove_file(self.local_path(name)).await;
        self.sealed.write().expect("sealed set poisoned").remove(name);
        self.inner.delete(name).await
    }

    async fn publish(&self, staged: &str, name: &str) -> Result<()> {
        // A stale mirror under the target name must not survive the rename.
        let _ = fs::remove_file(self.local_path(name)).await;
        self.inner.publish(staged, name).await
    }

    fn hint_sealed(&self, name: &str) {
        self.sealed
            .write()
            .expect("sealed set poisoned")
            .insert(name.to_string());
        self.inner.hint_sealed(name);
    }
}
