#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-store-memory** – In-memory storage driver for Skiff.
//!
//! The whole log lives in one heap buffer. Fast, non-persistent, no blob
//! rotation and no compaction; exactly what driver-level and stream-level
//! tests want underneath them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::RwLock;

use skiff_store_core::{
    decode_batch, encode_record, RawEvent, ReadBatch, Result, StorageDriver, WriteOutcome,
};

#[derive(Debug, Default)]
struct Inner {
    log: Vec<u8>,
    last_key: u32,
}

/// A heap-backed, non-persistent event log.
///
/// Writes serialize under one lock, so compare-and-append is exact; reads
/// take a shared lock and copy the requested window out, so concurrent
/// readers never observe a torn record.
#[derive(Debug, Clone, Default)]
pub struct MemoryDriver {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDriver {
    /// Create an empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held by the log. Test helper.
    pub async fn len(&self) -> u64 {
        self.inner.read().await.log.len() as u64
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn position(&self) -> Result<u64> {
        Ok(self.inner.read().await.log.len() as u64)
    }

    async fn last_key(&self) -> Result<u32> {
        Ok(self.inner.read().await.last_key)
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        let inner = self.inner.read().await;
        let len = inner.log.len() as u64;
        if from >= len {
            return Ok(ReadBatch { events: Vec::new(), next_position: from });
        }
        let start = from as usize;
        let end = len.min(from + limit as u64) as usize;
        let window = Bytes::copy_from_slice(&inner.log[start..end]);
        drop(inner);

        let (events, consumed) = decode_batch(&window);
        Ok(ReadBatch { events, next_position: from + consumed as u64 })
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let mut inner = self.inner.write().await;
        let len = inner.log.len() as u64;
        if at != len {
            return Ok(WriteOutcome { accepted: false, next_position: len });
        }
        let mut buf = BytesMut::new();
        for event in events {
            encode_record(&mut buf, event);
        }
        inner.log.extend_from_slice(&buf);
        if let Some(last) = events.last() {
            inner.last_key = last.sequence();
        }
        Ok(WriteOutcome { accepted: true, next_position: at + buf.len() as u64 })
    }

    async fn seek(&self, _key: u32) -> Result<u64> {
        // Single-blob log: the start is always a valid lower bound.
        Ok(0)
    }
}
