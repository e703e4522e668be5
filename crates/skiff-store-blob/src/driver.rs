//! The multi-blob driver: rotation, first-key index, compaction.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skiff_store_core::{
    decode_batch, decode_record, encode_record, BlobName, DecodeStep, ObjectStore, RawEvent,
    ReadBatch, Result, StorageDriver, StoreError, WriteOutcome, MAX_PAYLOAD_BYTES,
    RECORD_OVERHEAD,
};

// Chunk size for layout scans and compaction copies; must exceed the largest
// possible record so forward scans always make progress.
const SCAN_CHUNK: usize = 4 * 1024 * 1024;
const _: () = assert!(SCAN_CHUNK > MAX_PAYLOAD_BYTES + RECORD_OVERHEAD);

// Staged compaction output; deliberately not a parseable blob name, so a
// crash mid-compaction leaves nothing a refresh would mistake for the log.
const STAGING_NAME: &str = "staging.compact";

/// Tunables for [`BlobDriver`].
#[derive(Debug, Clone)]
pub struct BlobDriverConfig {
    /// Soft cap on the active blob. Once a write observes the active blob at
    /// or past this size it rotates to the next index first. The cap is
    /// implementation-defined; 512 MiB keeps blobs comfortably under
    /// object-store block limits.
    pub soft_blob_cap: u64,
    /// Number of sealed, non-compact blobs that triggers compaction.
    pub compaction_threshold: usize,
    /// Master switch for background compaction.
    pub compaction_enabled: bool,
}

impl Default for BlobDriverConfig {
    fn default() -> Self {
        Self {
            soft_blob_cap: 512 * 1024 * 1024,
            compaction_threshold: 2,
            compaction_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
struct BlobInfo {
    name: BlobName,
    len: u64,
    first_key: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct Layout {
    blobs: Vec<BlobInfo>,
    last_key: u32,
}

impl Layout {
    fn total_len(&self) -> u64 {
        self.blobs.iter().map(|b| b.len).sum()
    }

    /// Map a global position to `(blob index, in-blob offset)`.
    fn locate(&self, position: u64) -> Option<(usize, u64)> {
        let mut start = 0;
        for (idx, blob) in self.blobs.iter().enumerate() {
            if position < start + blob.len {
                return Some((idx, position - start));
            }
            start += blob.len;
        }
        None
    }
}

struct Inner<S> {
    store: S,
    config: BlobDriverConfig,
    layout: RwLock<Arc<Layout>>,
    write_gate: Mutex<()>,
    compaction: StdMutex<Option<JoinHandle<Result<()>>>>,
}

/// Append-only log partitioned across `events.NNNNN` blobs.
///
/// The active blob is always the highest-indexed one; sealed blobs are
/// immutable. The in-memory blob table is rebuilt whenever a write or a
/// finished compaction observes a new layout, or explicitly through
/// [`refresh`](StorageDriver::refresh).
pub struct BlobDriver<S: ObjectStore> {
    inner: Arc<Inner<S>>,
}

impl<S: ObjectStore> Clone for BlobDriver<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: ObjectStore> BlobDriver<S> {
    /// Open the log inside `store`, listing and validating its layout.
    pub async fn open(store: S, config: BlobDriverConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            store,
            config,
            layout: RwLock::new(Arc::new(Layout::default())),
            write_gate: Mutex::new(()),
            compaction: StdMutex::new(None),
        });
        inner.refresh_layout().await?;
        Ok(Self { inner })
    }

    /// Whether a compaction task handle is pending: the task is running, or
    /// has finished and waits for [`wait_for_compaction`] to reap its
    /// result.
    ///
    /// [`wait_for_compaction`]: BlobDriver::wait_for_compaction
    pub fn compaction_running(&self) -> bool {
        self.inner
            .compaction
            .lock()
            .expect("compaction slot poisoned")
            .is_some()
    }

    /// Await the running compaction, if any, and surface its result.
    pub async fn wait_for_compaction(&self) -> Result<()> {
        let handle = self
            .inner
            .compaction
            .lock()
            .expect("compaction slot poisoned")
            .take();
        match handle {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(join) if join.is_cancelled() => Ok(()),
                Err(join) => Err(StoreError::Backend(anyhow::anyhow!(
                    "compaction task failed: {join}"
                ))),
            },
        }
    }

    /// Abort a running compaction; used on service shutdown. Compaction is
    /// best-effort, so an aborted run just leaves the old layout in place.
    pub fn abort_compaction(&self) {
        if let Some(handle) = self
            .inner
            .compaction
            .lock()
            .expect("compaction slot poisoned")
            .take()
        {
            handle.abort();
        }
    }
}

impl<S: ObjectStore> Inner<S> {
    async fn snapshot(&self) -> Arc<Layout> {
        self.layout.read().await.clone()
    }

    /// Re-list the container and rebuild the blob table.
    async fn refresh_layout(&self) -> Result<()> {
        let metas = self.store.list().await?;
        let mut blobs = Vec::new();
        let mut compact: Option<BlobInfo> = None;
        for meta in metas {
            let name = match BlobName::parse(&meta.name) {
                Ok(name) => name,
                Err(_) => {
                    if meta.name != STAGING_NAME {
                        warn!(name = %meta.name, "ignoring foreign object in container");
                    }
                    continue;
                }
            };
            let info = BlobInfo { name, len: meta.len, first_key: None };
            if name.is_compact() {
                if compact.is_some() {
                    return Err(StoreError::CorruptLayout(
                        "more than one compact blob".into(),
                    ));
                }
                compact = Some(info);
            } else {
                blobs.push(info);
            }
        }

        if let Some(compact) = &compact {
            // Blobs the compact blob covers may linger while a finished
            // compaction is still deleting them; they are not part of the
            // layout any more.
            blobs.retain(|b| b.name.index() > compact.name.index());
        }
        blobs.sort_by_key(|b| b.name);
        if let Some(compact) = compact {
            blobs.insert(0, compact);
        }

        for pair in blobs.windows(2) {
            if pair[1].name.index() != pair[0].name.index() + 1 {
                return Err(StoreError::CorruptLayout(format!(
                    "gap between {} and {}",
                    pair[0].name, pair[1].name
                )));
            }
        }
        if let Some(first) = blobs.first() {
            if !first.name.is_compact() && first.name.index() != 0 {
                return Err(StoreError::CorruptLayout(format!(
                    "lowest blob is {}, expected events.00000",
                    first.name
                )));
            }
        }

        // Carry cached first keys over from the previous table.
        let previous = self.snapshot().await;
        for blob in &mut blobs {
            if let Some(old) = previous.blobs.iter().find(|b| b.name == blob.name) {
                blob.first_key = old.first_key;
            }
        }

        let last_key = self.scan_last_key(&blobs).await?;
        for blob in blobs.iter().take(blobs.len().saturating_sub(1)) {
            self.store.hint_sealed(&blob.name.to_string());
        }

        debug!(blobs = blobs.len(), last_key, "refreshed blob layout");
        *self.layout.write().await = Arc::new(Layout { blobs, last_key });
        Ok(())
    }

    /// Highest sequence in the log: forward-scan the last blob that holds
    /// any records.
    async fn scan_last_key(&self, blobs: &[BlobInfo]) -> Result<u32> {
        for blob in blobs.iter().rev() {
            let name = blob.name.to_string();
            let mut offset = 0u64;
            let mut last = None;
            while offset < blob.len {
                let window = self.store.read_range(&name, offset, SCAN_CHUNK).await?;
                if window.is_empty() {
                    break;
                }
                let (events, consumed) = decode_batch(&window);
                if let Some(event) = events.last() {
                    last = Some(event.sequence());
                }
                if consumed == 0 {
                    break;
                }
                offset += consumed as u64;
                if consumed < window.len() {
                    break;
                }
            }
            if let Some(last) = last {
                return Ok(last);
            }
        }
        Ok(0)
    }

    /// First sequence of the blob at `idx`, decoded and cached lazily.
    async fn first_key(&self, layout: &Layout, idx: usize) -> Result<Option<u32>> {
        let blob = &layout.blobs[idx];
        if let Some(key) = blob.first_key {
            return Ok(Some(key));
        }
        if blob.len == 0 {
            return Ok(None);
        }
        let window_len = SCAN_CHUNK.min(blob.len as usize);
        let header = self
            .store
            .read_range(&blob.name.to_string(), 0, window_len)
            .await?;
        let key = match decode_record(&header, 0) {
            DecodeStep::Record { event, .. } => Some(event.sequence()),
            _ => None,
        };
        if let Some(key) = key {
            let mut guard = self.layout.write().await;
            let mut updated = (**guard).clone();
            if let Some(entry) = updated.blobs.iter_mut().find(|b| b.name == blob.name) {
                entry.first_key = Some(key);
            }
            *guard = Arc::new(updated);
        }
        Ok(key)
    }
}

fn maybe_start_compaction<S: ObjectStore>(inner: &Arc<Inner<S>>, layout: &Layout) {
    if !inner.config.compaction_enabled || layout.blobs.len() < 2 {
        return;
    }
    let sealed = &layout.blobs[..layout.blobs.len() - 1];
    let sealed_non_compact = sealed.iter().filter(|b| !b.name.is_compact()).count();
    if sealed_non_compact < inner.config.compaction_threshold {
        return;
    }

    let mut slot = inner.compaction.lock().expect("compaction slot poisoned");
    if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
        return;
    }
    let sources: Vec<(String, u64)> = sealed
        .iter()
        .map(|b| (b.name.to_string(), b.len))
        .collect();
    let target = BlobName::compacted(sealed.last().map(|b| b.name.index()).unwrap_or(0));
    info!(sources = sources.len(), target = %target, "starting compaction");
    let task_inner = Arc::clone(inner);
    *slot = Some(tokio::spawn(compact(task_inner, sources, target)));
}

/// Rewrite the sealed `sources` verbatim into a single compact blob.
///
/// The staged object becomes visible only through the atomic publish; until
/// the publish lands, readers keep seeing the old layout. After the sources
/// are deleted the shared blob table is rebuilt so the next reader picks up
/// the collapsed layout.
async fn compact<S: ObjectStore>(
    inner: Arc<Inner<S>>,
    sources: Vec<(String, u64)>,
    target: BlobName,
) -> Result<()> {
    // The layout that scheduled this run may be stale; skip rather than
    // compact blobs that no longer exist.
    for (name, _) in &sources {
        if inner.store.len(name).await?.is_none() {
            warn!(blob = %name, "compaction source vanished, skipping run");
            return Ok(());
        }
    }

    inner.store.create(STAGING_NAME).await?;
    let mut staged_len = 0u64;
    for (name, len) in &sources {
        let mut offset = 0u64;
        while offset < *len {
            let window = inner.store.read_range(name, offset, SCAN_CHUNK).await?;
            if window.is_empty() {
                break;
            }
            let (_, consumed) = decode_batch(&window);
            if consumed == 0 {
                warn!(blob = %name, offset, "sealed blob ends in a torn record");
                break;
            }
            let appended = inner
                .store
                .append(STAGING_NAME, staged_len, &window[..consumed])
                .await?;
            if !appended.accepted {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "staged compaction object was modified concurrently"
                )));
            }
            staged_len = appended.new_len;
            offset += consumed as u64;
        }
    }

    inner.store.publish(STAGING_NAME, &target.to_string()).await?;
    for (name, _) in &sources {
        inner.store.delete(name).await?;
    }
    info!(target = %target, bytes = staged_len, "compaction published");

    if let Err(err) = inner.refresh_layout().await {
        warn!(error = %err, "post-compaction layout refresh failed");
    }
    Ok(())
}

#[async_trait]
impl<S: ObjectStore> StorageDriver for BlobDriver<S> {
    async fn position(&self) -> Result<u64> {
        Ok(self.inner.snapshot().await.total_len())
    }

    async fn last_key(&self) -> Result<u32> {
        Ok(self.inner.snapshot().await.last_key)
    }

    async fn read(&self, from: u64, limit: usize) -> Result<ReadBatch> {
        let inner = &self.inner;
        let mut layout = inner.snapshot().await;
        if from >= layout.total_len() {
            return Ok(ReadBatch { events: Vec::new(), next_position: from });
        }
        let Some((idx, in_blob)) = layout.locate(from) else {
            return Ok(ReadBatch { events: Vec::new(), next_position: from });
        };
        let blob = &layout.blobs[idx];
        let take = limit.min((blob.len - in_blob) as usize);

        let window = match inner
            .store
            .read_range(&blob.name.to_string(), in_blob, take)
            .await
        {
            Ok(window) => window,
            Err(_) => {
                // The blob may have been compacted away under us; one
                // refresh and retry against the new layout.
                inner.refresh_layout().await?;
                layout = inner.snapshot().await;
                let Some((idx, in_blob)) = layout.locate(from) else {
                    return Ok(ReadBatch { events: Vec::new(), next_position: from });
                };
                let blob = &layout.blobs[idx];
                let take = limit.min((blob.len - in_blob) as usize);
                inner
                    .store
                    .read_range(&blob.name.to_string(), in_blob, take)
                    .await?
            }
        };

        let (events, consumed) = decode_batch(&window);
        Ok(ReadBatch { events, next_position: from + consumed as u64 })
    }

    async fn write(&self, at: u64, events: &[RawEvent]) -> Result<WriteOutcome> {
        let inner = &self.inner;
        let _gate = inner.write_gate.lock().await;

        let mut layout = inner.snapshot().await;
        if at != layout.total_len() {
            // Another writer or a published compaction may have moved the
            // layout; re-list before giving up.
            inner.refresh_layout().await?;
            layout = inner.snapshot().await;
            if at != layout.total_len() {
                return Ok(WriteOutcome { accepted: false, next_position: layout.total_len() });
            }
        }

        let mut updated = (*layout).clone();
        match updated.blobs.last() {
            None => {
                let name = BlobName::events(0);
                inner.store.create(&name.to_string()).await?;
                updated.blobs.push(BlobInfo { name, len: 0, first_key: None });
            }
            Some(active) if active.len >= inner.config.soft_blob_cap => {
                let name = active.name.next();
                debug!(sealed = %active.name, new = %name, "rotating active blob");
                inner.store.create(&name.to_string()).await?;
                inner.store.hint_sealed(&active.name.to_string());
                updated.blobs.push(BlobInfo { name, len: 0, first_key: None });
            }
            Some(_) => {}
        }

        let mut buf = BytesMut::new();
        for event in events {
            encode_record(&mut buf, event);
        }
        let active = updated.blobs.last_mut().expect("active blob exists");
        let appended = inner
            .store
            .append(&active.name.to_string(), active.len, &buf)
            .await?;
        if !appended.accepted {
            // Blob-level race with another process; adopt what it observed.
            inner.refresh_layout().await?;
            let observed = inner.snapshot().await.total_len();
            return Ok(WriteOutcome { accepted: false, next_position: observed });
        }

        active.len = appended.new_len;
        if active.first_key.is_none() {
            active.first_key = events.first().map(RawEvent::sequence);
        }
        if let Some(last) = events.last() {
            updated.last_key = last.sequence();
        }
        let updated = Arc::new(updated);
        *inner.layout.write().await = Arc::clone(&updated);

        maybe_start_compaction(inner, &updated);
        Ok(WriteOutcome { accepted: true, next_position: at + buf.len() as u64 })
    }

    async fn seek(&self, key: u32) -> Result<u64> {
        let inner = &self.inner;
        let layout = inner.snapshot().await;
        let mut start = 0u64;
        let mut result = 0u64;
        for idx in 0..layout.blobs.len() {
            match inner.first_key(&layout, idx).await? {
                Some(first) if first <= key => result = start,
                _ => break,
            }
            start += layout.blobs[idx].len;
        }
        Ok(result)
    }

    async fn refresh(&self) -> Result<()> {
        self.inner.refresh_layout().await
    }
}
