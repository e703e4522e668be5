#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-stream** – Typed, sequence-numbered event stream for Skiff.
//!
//! [`EventStream`] layers a typed view over a storage driver: it prefetches
//! raw records in the background while the owner drains already-queued
//! events, serializes writes with compare-and-append semantics, and can seek
//! forward past a target sequence.
//!
//! Queued records hold refcounted [`bytes::Bytes`] payloads, so a fetch in
//! flight never invalidates what is already queued; fetched records only
//! enter the queue at commit time, on the owning task.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use skiff_store_core::{RawEvent, StorageDriver, StoreError};

mod codec;

pub use codec::{CodecError, EventCodec, MsgPackCodec};

/// Upper bound on the bytes fetched per driver read.
pub const FETCH_LIMIT: usize = 4 * 1024 * 1024;

/// Errors raised by stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The storage driver failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An event could not be serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A queued record whose payload did not decode.
///
/// The stream's `sequence` has already advanced past the record; the caller
/// owns quarantining it.
#[derive(Debug)]
pub struct DecodeFailure {
    /// Sequence of the offending record.
    pub sequence: u32,
    /// Its raw payload, for diagnostics.
    pub payload: Bytes,
    /// Why decoding failed.
    pub source: CodecError,
}

/// Result of one background fetch, to be handed to
/// [`EventStream::commit_fetch`] on the owning task.
#[derive(Debug)]
pub struct FetchBatch {
    from_position: u64,
    events: Vec<RawEvent>,
    next_position: u64,
}

/// Typed, prefetching view over an append-only event log.
pub struct EventStream<E> {
    driver: Arc<dyn StorageDriver>,
    codec: Arc<dyn EventCodec<E>>,
    queue: VecDeque<RawEvent>,
    sequence: u32,
    last_sequence: u32,
    position: u64,
    // Highest remote tail observed by a refused write; writing below it is
    // pointless, so `write` short-circuits until the stream catches up.
    minimum_write_position: u64,
}

impl<E: 'static> EventStream<E> {
    /// Build a stream over `driver` with an explicit codec.
    pub fn new(driver: Arc<dyn StorageDriver>, codec: Arc<dyn EventCodec<E>>) -> Self {
        Self {
            driver,
            codec,
            queue: VecDeque::new(),
            sequence: 0,
            last_sequence: 0,
            position: 0,
            minimum_write_position: 0,
        }
    }

    /// Sequence of the last event drained through [`try_get_next`], 0 if
    /// none.
    ///
    /// [`try_get_next`]: EventStream::try_get_next
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Highest sequence in the prefetch queue (equal to [`sequence`] when
    /// the queue is empty).
    ///
    /// [`sequence`]: EventStream::sequence
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Logical byte offset up to which remote events have been consumed.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Records queued and not yet drained.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start one driver read at the current position.
    ///
    /// The returned future owns everything it needs, so it may be spawned or
    /// polled while the caller keeps draining queued events; only
    /// [`try_get_next`](EventStream::try_get_next) may run concurrently with
    /// it. Hand its output to [`commit_fetch`](EventStream::commit_fetch).
    pub fn begin_fetch(
        &self,
    ) -> impl Future<Output = Result<FetchBatch, StoreError>> + Send + 'static {
        let driver = Arc::clone(&self.driver);
        let from = self.position;
        async move {
            let batch = driver.read(from, FETCH_LIMIT).await?;
            Ok(FetchBatch {
                from_position: from,
                events: batch.events,
                next_position: batch.next_position,
            })
        }
    }

    /// Fold a finished fetch into the stream, on the owning task.
    ///
    /// Returns `false` only when the fetch proved the stream is at end of
    /// log. A batch fetched while the queue is still non-empty (or while the
    /// position moved under it) is discarded and reports `true`, so callers
    /// simply fetch again after draining.
    pub fn commit_fetch(&mut self, batch: FetchBatch) -> bool {
        if !self.queue.is_empty() {
            return true;
        }
        if batch.from_position != self.position {
            return true;
        }
        let produced = !batch.events.is_empty();
        for record in batch.events {
            self.last_sequence = record.sequence();
            self.queue.push_back(record);
        }
        self.position = batch.next_position;
        produced
    }

    /// Fetch and commit in one step, for sequential callers.
    pub async fn fetch(&mut self) -> Result<bool, StoreError> {
        let pending = self.begin_fetch();
        let batch = pending.await?;
        Ok(self.commit_fetch(batch))
    }

    /// Dequeue and decode the next event, advancing `sequence` even when
    /// decoding fails.
    pub fn try_get_next(&mut self) -> Result<Option<E>, DecodeFailure> {
        let Some(record) = self.queue.pop_front() else {
            return Ok(None);
        };
        self.sequence = record.sequence();
        match self.codec.decode(record.payload()) {
            Ok(event) => Ok(Some(event)),
            Err(source) => Err(DecodeFailure {
                sequence: record.sequence(),
                payload: record.payload().clone(),
                source,
            }),
        }
    }

    /// Serialize `events`, assign them the sequences after `last_sequence`,
    /// and compare-and-append them at the current position.
    ///
    /// On success the records are queued locally (an immediate drain sees
    /// them) and the first assigned sequence is returned. `None` means the
    /// append lost a race and the stream must catch up before retrying.
    pub async fn write(&mut self, events: &[E]) -> Result<Option<u32>, StreamError> {
        if self.position < self.minimum_write_position {
            debug!(
                position = self.position,
                minimum = self.minimum_write_position,
                "skipping write below the observed remote tail"
            );
            return Ok(None);
        }
        let first = self.last_sequence + 1;
        let mut records = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let payload = self.codec.encode(event)?;
            let record = RawEvent::new(first + i as u32, payload).map_err(StreamError::Store)?;
            records.push(record);
        }

        let outcome = self
            .driver
            .write(self.position, &records)
            .await
            .map_err(StreamError::Store)?;
        if !outcome.accepted {
            self.minimum_write_position = outcome.next_position;
            return Ok(None);
        }
        self.position = outcome.next_position;
        for record in records {
            self.last_sequence = record.sequence();
            self.queue.push_back(record);
        }
        Ok(Some(first))
    }

    /// Skip forward so the next [`try_get_next`](EventStream::try_get_next)
    /// yields the event with sequence `key`, if it exists.
    ///
    /// Returns the resulting `sequence`: `min(key - 1, last in stream)` for
    /// `key > 0`. Records below `key` are consumed without being queued.
    pub async fn discard_up_to(&mut self, key: u32) -> Result<u32, StoreError> {
        if key == 0 {
            return Ok(self.sequence);
        }

        let sought = self.driver.seek(key).await?;
        if sought > self.position {
            debug!(key, from = self.position, to = sought, "seek moved the stream forward");
            self.position = sought;
        }

        while let Some(front) = self.queue.front() {
            if front.sequence() >= key {
                break;
            }
            let record = self.queue.pop_front().expect("front checked above");
            self.sequence = record.sequence();
        }

        while self.last_sequence < key {
            let batch = self.driver.read(self.position, FETCH_LIMIT).await?;
            if batch.events.is_empty() {
                // Past end of log; everything seen counts as drained.
                self.sequence = self.last_sequence;
                break;
            }
            self.position = batch.next_position;
            for record in batch.events {
                self.last_sequence = record.sequence();
                if record.sequence() >= key {
                    self.queue.push_back(record);
                } else {
                    self.sequence = record.sequence();
                }
            }
        }
        Ok(self.sequence)
    }

    /// Forget everything fetched: clear the queue and zero the counters.
    /// The observed remote tail survives, it is still the observed tail.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.sequence = 0;
        self.last_sequence = 0;
        self.position = 0;
    }
}

impl<E> EventStream<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build a stream with the default MessagePack codec.
    pub fn msgpack(driver: Arc<dyn StorageDriver>) -> Self {
        Self::new(driver, Arc::new(MsgPackCodec::new()))
    }
}
