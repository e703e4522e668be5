//! Shared fixtures for the runtime tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use skiff_projection::Projection;
use skiff_store_core::{RawEvent, ReadBatch, Result, StorageDriver, StoreError, WriteOutcome};
use skiff_store_memory::MemoryDriver;
use skiff_stream::{EventCodec, MsgPackCodec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerEvent {
    Credit(u64),
    Poison,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub balance: u64,
    pub entries: u32,
}

pub struct Ledger;

impl Projection for Ledger {
    type Event = LedgerEvent;
    type State = LedgerState;

    fn full_name(&self) -> &str {
        "ledger"
    }

    fn initial(&self) -> LedgerState {
        LedgerState::default()
    }

    fn apply(&self, _sequence: u32, event: &LedgerEvent, previous: &LedgerState) -> anyhow::Result<LedgerState> {
        match event {
            LedgerEvent::Credit(amount) => Ok(LedgerState {
                balance: previous.balance + amount,
                entries: previous.entries + 1,
            }),
            LedgerEvent::Poison => anyhow::bail!("poisoned ledger entry"),
        }
    }

    fn try_save(&self, state: &LedgerState) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(Some(rmp_serde::to_vec_named(state)?))
    }

    fn try_load(&self, bytes: &[u8]) -> anyhow::Result<LedgerState> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Same fold, but the snapshot round-trip is broken: saves succeed and
/// loads always fail.
pub struct BrokenSnapshotLedger;

impl Projection for BrokenSnapshotLedger {
    type Event = LedgerEvent;
    type State = LedgerState;

    fn full_name(&self) -> &str {
        "ledger"
    }

    fn initial(&self) -> LedgerState {
        LedgerState::default()
    }

    fn apply(&self, sequence: u32, event: &LedgerEvent, previous: &LedgerState) -> anyhow::Result<LedgerState> {
        Ledger.apply(sequence, event, previous)
    }

    fn try_save(&self, state: &LedgerState) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(Some(rmp_serde::to_vec_named(state)?))
    }

    fn try_load(&self, _bytes: &[u8]) -> anyhow::Result<LedgerState> {
        anyhow::bail!("snapshot bytes rot on the way back")
    }
}

/// Driver decorator that injects one rival append immediately before the
/// next write attempt, forcing a deterministic compare-and-append loss.
pub struct ContendedDriver {
    inner: MemoryDriver,
    rivals_pending: AtomicU32,
}

impl ContendedDriver {
    pub fn new(inner: MemoryDriver, rivals: u32) -> Self {
        Self { inner, rivals_pending: AtomicU32::new(rivals) }
    }

    async fn sneak_rival(&self) -> Result<()> {
        let position = self.inner.position().await?;
        let sequence = self.inner.last_key().await? + 1;
        let codec = MsgPackCodec::<LedgerEvent>::new();
        let payload = codec
            .encode(&LedgerEvent::Credit(1_000))
            .map_err(|e| StoreError::Backend(anyhow::anyhow!(e)))?;
        let rival = RawEvent::new(sequence, payload)?;
        let outcome = self.inner.write(position, &[rival]).await?;
        assert!(outcome.accepted, "rival append must land");
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for ContendedDriver {
    async fn position(&self) -> Result<u64> {
        self.inner.position().await
    }

    async fn last_key(&self) -> Result<u32> {
        self.inner.last_key().await
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        self.inner.read(from, limit).await
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        if self
            .rivals_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.sneak_rival().await?;
        }
        self.inner.write(at, events).await
    }

    async fn seek(&self, key: u32) -> Result<u64> {
        self.inner.seek(key).await
    }
}

/// Driver whose `seek` fails a fixed number of times before recovering;
/// drives the service's init-retry loop.
pub struct FlakyDriver {
    inner: MemoryDriver,
    failures_left: AtomicU32,
}

impl FlakyDriver {
    pub fn new(inner: MemoryDriver, failures: u32) -> Self {
        Self { inner, failures_left: AtomicU32::new(failures) }
    }
}

#[async_trait]
impl StorageDriver for FlakyDriver {
    async fn position(&self) -> Result<u64> {
        self.inner.position().await
    }

    async fn last_key(&self) -> Result<u32> {
        self.inner.last_key().await
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        self.inner.read(from, limit).await
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        self.inner.write(at, events).await
    }

    async fn seek(&self, key: u32) -> Result<u64> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "injected outage",
            )));
        }
        self.inner.seek(key).await
    }
}

/// Seed `count` credit events of 1 each through a throwaway stream.
pub async fn seed_credits(driver: &MemoryDriver, count: u32) {
    let mut stream =
        skiff_stream::EventStream::<LedgerEvent>::msgpack(Arc::new(driver.clone()));
    // Catch up first so the appends land at the real tail.
    while stream.fetch().await.unwrap() {
        while stream.try_get_next().unwrap().is_some() {}
    }
    for _ in 0..count {
        stream
            .write(&[LedgerEvent::Credit(1)])
            .await
            .unwrap()
            .expect("seed write accepted");
    }
}
