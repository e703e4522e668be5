//! Single-append-blob driver, used for backups.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;

use skiff_store_core::{
    decode_batch, encode_record, BlobName, ObjectStore, RawEvent, ReadBatch, Result,
    StorageDriver, WriteOutcome,
};

const SCAN_CHUNK: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
struct Tail {
    len: u64,
    last_key: u32,
}

/// The whole log in one append-only object; no rotation, no compaction.
///
/// The object is named `events.00000` so a backup written through this
/// driver reads back through [`BlobDriver`](crate::BlobDriver) as well.
pub struct AppendBlobDriver<S> {
    store: Arc<S>,
    name: String,
    tail: Mutex<Tail>,
}

impl<S: ObjectStore> AppendBlobDriver<S> {
    /// Open the single blob inside `store`, creating it when absent.
    pub async fn open(store: S) -> Result<Self> {
        let store = Arc::new(store);
        let name = BlobName::events(0).to_string();
        if store.len(&name).await?.is_none() {
            store.create(&name).await?;
        }
        let driver = Self { store, name, tail: Mutex::new(Tail { len: 0, last_key: 0 }) };
        {
            let mut tail = driver.tail.lock().await;
            *tail = driver.scan_from(Tail { len: 0, last_key: 0 }).await?;
        }
        Ok(driver)
    }

    /// Decode forward from a known-good tail, picking up appends made by
    /// other writers.
    async fn scan_from(&self, mut tail: Tail) -> Result<Tail> {
        let remote = self.store.len(&self.name).await?.unwrap_or(0);
        while tail.len < remote {
            let window = self
                .store
                .read_range(&self.name, tail.len, SCAN_CHUNK)
                .await?;
            if window.is_empty() {
                break;
            }
            let (events, consumed) = decode_batch(&window);
            if let Some(last) = events.last() {
                tail.last_key = last.sequence();
            }
            if consumed == 0 {
                break;
            }
            tail.len += consumed as u64;
            if consumed < window.len() {
                break;
            }
        }
        Ok(tail)
    }
}

#[async_trait]
impl<S: ObjectStore> StorageDriver for AppendBlobDriver<S> {
    async fn position(&self) -> Result<u64> {
        let mut tail = self.tail.lock().await;
        *tail = self.scan_from(*tail).await?;
        Ok(tail.len)
    }

    async fn last_key(&self) -> Result<u32> {
        let mut tail = self.tail.lock().await;
        *tail = self.scan_from(*tail).await?;
        Ok(tail.last_key)
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        let window = self.store.read_range(&self.name, from, limit).await?;
        let (events, consumed) = decode_batch(&window);
        Ok(ReadBatch { events, next_position: from + consumed as u64 })
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let mut buf = BytesMut::new();
        for event in events {
            encode_record(&mut buf, event);
        }
        let mut tail = self.tail.lock().await;
        let appended = self.store.append(&self.name, at, &buf).await?;
        if !appended.accepted {
            return Ok(WriteOutcome { accepted: false, next_position: appended.new_len });
        }
        tail.len = appended.new_len;
        if let Some(last) = events.last() {
            tail.last_key = last.sequence();
        }
        Ok(WriteOutcome { accepted: true, next_position: appended.new_len })
    }

    async fn seek(&self, _key: u32) -> Result<u64> {
        Ok(0)
    }
}
