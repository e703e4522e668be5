//! Filesystem-backed object store.
//!
//! Each object is one file under the container directory. Appends are
//! length-checked under a store-wide lock, which gives this backend the same
//! conditional-append contract as a remote append blob within one process;
//! cross-process writers race at the filesystem's mercy and are expected to
//! go through the same store instance or tolerate refused retries.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use skiff_store_core::{ObjectAppend, ObjectMeta, ObjectStore, Result, StoreError};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// One file per object under a root directory.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    append_gate: Mutex<()>,
}

impl FsObjectStore {
    /// Open (creating if needed) the container directory at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root, append_gate: Mutex::new(()) })
    }

    /// The container directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
    )
}

/// Run `op`, retrying transient I/O failures with doubling backoff.
async fn with_retries<T, F, Fut>(what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < RETRY_ATTEMPTS => {
                warn!(what, attempt, error = %err, "transient i/o failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self) -> Result<Vec<ObjectMeta>> {
        // Object names may contain '/' (e.g. versioned snapshots), so the
        // walk descends into subdirectories.
        let mut pending = vec![self.root.clone()];
        let mut metas = Vec::new();
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&self.root).map(Path::to_path_buf)
                else {
                    continue;
                };
                let name = relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                metas.push(ObjectMeta { name, len: meta.len() });
            }
        }
        Ok(metas)
    }

    async fn len(&self, name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.path_for(name)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_range(&self, name: &str, offset: u64, limit: usize) -> Result<Bytes> {
        let path = self.path_for(name);
        with_retries("read_range", || {
            let path = path.clone();
            async move {
                let mut file = File::open(&path).await?;
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
        })
        .await
    }

    async fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> Result<ObjectAppend> {
        let _gate = self.append_gate.lock().await;
        let path = self.path_for(name);
        let current = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        if current != expected_len {
            return Ok(ObjectAppend { accepted: false, new_len: current });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;
        file.write_all(data).await?;
        file.sync_data().await?;
        debug!(name, appended = data.len(), new_len = current + data.len() as u64, "appended");
        Ok(ObjectAppend { accepted: true, new_len: current + data.len() as u64 })
    }

    async fn create(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        File::create(path).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_for(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn publish(&self, staged: &str, name: &str) -> Result<()> {
        fs::rename(self.path_for(staged), self.path_for(name)).await?;
        Ok(())
    }
}
