#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-store-file** – Single-file storage driver for Skiff.
//!
//! One append-only file holds the whole log; there is no blob rotation and
//! no compaction. On open, the driver scans the file, drops the debris of a
//! crashed writer past the last clean record, and appends from there.
//!
//! A second driver instance on the same path observes appends made by the
//! first (the tail is re-synced before every compare-and-append), which is
//! enough for the optimistic single-machine scenarios this backend serves.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use skiff_store_core::{
    decode_batch, encode_record, RawEvent, ReadBatch, Result, StorageDriver, WriteOutcome,
};

// Larger than any single record (512 KiB payload + overhead), so the
// recovery scan always makes progress on clean input.
const SCAN_CHUNK: usize = 4 * 1024 * 1024;

#[derive(Debug)]
struct Inner {
    file: File,
    len: u64,
    last_key: u32,
}

/// An event log in one append-only file.
#[derive(Debug)]
pub struct FileDriver {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileDriver {
    /// Open or create the log file at `path` and recover its clean length.
    ///
    /// Bytes past the last complete record are truncated away so the next
    /// append lands on a record boundary.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .await?;

        let (clean_len, last_key) = scan(&path, 0, 0).await?;
        let file_len = file.metadata().await?.len();
        if clean_len < file_len {
            warn!(
                path = %path.display(),
                clean_len,
                file_len,
                "dropping truncated tail left by a crashed writer"
            );
            file.set_len(clean_len).await?;
        }
        debug!(path = %path.display(), len = clean_len, last_key, "opened log file");

        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, len: clean_len, last_key }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pick up records appended to the file by another driver instance.
    async fn sync_tail(&self, inner: &mut Inner) -> Result<()> {
        let file_len = inner.file.metadata().await?.len();
        if file_len > inner.len {
            let (clean_len, last_key) = scan(&self.path, inner.len, inner.last_key).await?;
            inner.len = clean_len;
            inner.last_key = last_key;
        }
        Ok(())
    }
}

/// Scan the file from `from`, returning the clean length and last sequence.
async fn scan(path: &Path, from: u64, last_key: u32) -> Result<(u64, u32)> {
    let mut reader = File::open(path).await?;
    let mut offset = from;
    let mut last_key = last_key;
    loop {
        reader.seek(SeekFrom::Start(offset)).await?;
        let window = read_up_to(&mut reader, SCAN_CHUNK).await?;
        if window.is_empty() {
            return Ok((offset, last_key));
        }
        let (events, consumed) = decode_batch(&window);
        if let Some(last) = events.last() {
            last_key = last.sequence();
        }
        offset += consumed as u64;
        if consumed < window.len() {
            // Truncated tail, or a record boundary at end of window with
            // nothing after it; either way the scan is done.
            return Ok((offset, last_key));
        }
    }
}

async fn read_up_to(reader: &mut File, limit: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}

#[async_trait]
impl StorageDriver for FileDriver {
    async fn position(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        self.sync_tail(&mut inner).await?;
        Ok(inner.len)
    }

    async fn last_key(&self) -> Result<u32> {
        let mut inner = self.inner.lock().await;
        self.sync_tail(&mut inner).await?;
        Ok(inner.last_key)
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        let mut reader = File::open(&self.path).await?;
        reader.seek(SeekFrom::Start(from)).await?;
        let window = read_up_to(&mut reader, limit).await?;
        let (events, consumed) = decode_batch(&window);
        Ok(ReadBatch { events, next_position: from + consumed as u64 })
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let mut inner = self.inner.lock().await;
        self.sync_tail(&mut inner).await?;
        if at != inner.len {
            return Ok(WriteOutcome { accepted: false, next_position: inner.len });
        }

        let mut buf = BytesMut::new();
        for event in events {
            encode_record(&mut buf, event);
        }
        inner.file.write_all(&buf).await?;
        inner.file.sync_data().await?;
        inner.len += buf.len() as u64;
        if let Some(last) = events.last() {
            inner.last_key = last.sequence();
        }
        Ok(WriteOutcome { accepted: true, next_position: inner.len })
    }

    async fn seek(&self, _key: u32) -> Result<u64> {
        Ok(0)
    }
}
