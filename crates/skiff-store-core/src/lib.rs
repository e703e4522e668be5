#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-store-core** – Core storage abstractions for Skiff.
//!
//! This crate defines the contracts shared by every storage backend: the
//! on-disk record codec, blob naming, the [`StorageDriver`] trait with its
//! compare-and-append write semantics, the [`ObjectStore`] seam behind the
//! multi-blob driver, and connection-string configuration.
//!
//! Storage drivers (in-memory, single-file, multi-blob, etc.) implement these
//! traits in separate crates that depend on this core abstraction.

use async_trait::async_trait;

mod blob;
mod config;
mod object;
mod record;

pub use blob::BlobName;
pub use config::StoreConfig;
pub use object::{ObjectAppend, ObjectMeta, ObjectStore};
pub use record::{
    checksum, decode_batch, decode_record, encode_record, encoded_len, DecodeStep, RawEvent,
    MAX_PAYLOAD_BYTES, RECORD_MAGIC, RECORD_MAGIC_TAIL, RECORD_OVERHEAD,
};

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors surfaced by the record codec and the storage drivers.
///
/// A refused compare-and-append is *not* an error; it is reported through
/// [`WriteOutcome::accepted`]. Mid-log truncation is not an error either; the
/// read path stops at the last clean record.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// Payload length is zero or not a multiple of eight.
    #[error("payload length {0} is not a positive multiple of 8")]
    PayloadAlignment(usize),
    /// Payload exceeds the per-event limit.
    #[error("payload length {0} exceeds {MAX_PAYLOAD_BYTES} bytes")]
    PayloadTooLarge(usize),
    /// A name did not parse as an event blob name.
    #[error("not a valid blob name: {0:?}")]
    BlobName(String),
    /// A connection string did not parse.
    #[error("invalid connection string: {0}")]
    Config(String),
    /// Write attempted through a read-only driver.
    #[error("driver is read-only")]
    ReadOnly,
    /// The log layout is inconsistent (e.g. two compact blobs).
    #[error("corrupt log: {0}")]
    CorruptLayout(String),
    /// Backend-specific failure that survived the driver's own retries.
    #[error("storage backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Convenience alias used throughout the storage crates.
pub type Result<T> = std::result::Result<T, StoreError>;

//─────────────────────────────
//  Driver contract
//─────────────────────────────

/// A batch of whole records decoded by [`StorageDriver::read`].
#[derive(Debug, Clone)]
pub struct ReadBatch {
    /// Decoded records, in log order. Empty when `from` was at end of log.
    pub events: Vec<RawEvent>,
    /// Position just past the last record consumed; equal to `from` when the
    /// batch is empty.
    pub next_position: u64,
}

/// Outcome of a compare-and-append attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Whether the events were appended.
    pub accepted: bool,
    /// On success, the position just past the appended records. On refusal,
    /// the observed current log length, so the caller can re-read and retry.
    pub next_position: u64,
}

/// Abstraction over an append-only, strictly ordered event log.
///
/// Positions are byte offsets into the logical log (the concatenation of all
/// blobs in index order); sequences are the writer-assigned `u32` keys.
/// All methods are cancel-safe in the usual Rust sense: dropping the future
/// abandons the call, and a dropped `write` may or may not have reached the
/// log - re-read to find out.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Byte length of the entire log.
    async fn position(&self) -> Result<u64>;

    /// Highest sequence in the log, `0` if the log is empty.
    async fn last_key(&self) -> Result<u32>;

    /// Read as many whole records as fit in `limit` bytes starting at `from`.
    ///
    /// Never returns a partial record. Stops at a truncated tail and returns
    /// `next_position` just past the last complete record consumed.
    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch>;

    /// Compare-and-append: succeeds only if `at` equals the current log
    /// length at the moment the write is attempted.
    ///
    /// A refused write is not an error; the outcome carries the observed
    /// tail position.
    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome>;

    /// A position `p` such that the record with sequence `key`, if present,
    /// begins at some offset `>= p`.
    async fn seek(&self, key: u32) -> Result<u64>;

    /// Re-list the backing layout. Drivers without a cached layout keep the
    /// default no-op.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<D: StorageDriver + ?Sized> StorageDriver for std::sync::Arc<D> {
    async fn position(&self) -> Result<u64> {
        (**self).position().await
    }

    async fn last_key(&self) -> Result<u32> {
        (**self).last_key().await
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        (**self).read(from, limit).await
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        (**self).write(at, events).await
    }

    async fn seek(&self, key: u32) -> Result<u64> {
        (**self).seek(key).await
    }

    async fn refresh(&self) -> Result<()> {
        (**self).refresh().await
    }
}

//─────────────────────────────
//  Read-only wrapper
//─────────────────────────────

/// Driver decorator that forbids writes.
///
/// Selected by `ReadOnly=true` in a connection string; useful for consumers
/// that must never advance someone else's log.
#[derive(Debug, Clone)]
pub struct ReadOnlyDriver<D> {
    inner: D,
}

impl<D> ReadOnlyDriver<D> {
    /// Wrap `inner`, forbidding writes through the wrapper.
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    /// Recover the wrapped driver.
    pub fn into_inner(self) -> D {
        self.inner
    }
}

#[async_trait]
impl<D: StorageDriver> StorageDriver for ReadOnlyDriver<D> {
    async fn position(&self) -> Result<u64> {
        self.inner.position().await
    }

    async fn last_key(&self) -> Result<u32> {
        self.inner.last_key().await
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        self.inner.read(from, limit).await
    }

    async fn write(&self, _at: u64, _events: &[RawEvent]) -> Result<WriteOutcome> {
        Err(StoreError::ReadOnly)
    }

    async fn seek(&self, key: u32) -> Result<u64> {
        self.inner.seek(key).await
    }

    async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }
}
