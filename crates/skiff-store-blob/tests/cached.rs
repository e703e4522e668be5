//! Local-mirror cache and append-blob scenarios.

use bytes::Bytes;

use skiff_store_blob::{
    AppendBlobDriver, BlobDriver, BlobDriverConfig, CachedStore, FsObjectStore,
    MemoryObjectStore,
};
use skiff_store_core::{RawEvent, StorageDriver};

fn event(sequence: u32, len: usize) -> RawEvent {
    let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    RawEvent::new(sequence, Bytes::from(payload)).unwrap()
}

async fn read_all(driver: &impl StorageDriver) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut cursor = 0;
    loop {
        let batch = driver.read(cursor, 1 << 20).await.unwrap();
        if batch.events.is_empty() {
            break;
        }
        events.extend(batch.events);
        cursor = batch.next_position;
    }
    events
}

#[tokio::test]
async fn sealed_blobs_are_mirrored_locally() {
    let cache_dir = tempfile::tempdir().unwrap();
    let remote = MemoryObjectStore::new();
    let cached = CachedStore::open(remote.clone(), cache_dir.path()).await.unwrap();
    let config = BlobDriverConfig {
        soft_blob_cap: 320,
        compaction_threshold: 2,
        compaction_enabled: false,
    };
    let driver = BlobDriver::open(cached, config).await.unwrap();

    let mut position = 0;
    for sequence in 1u32..=15 {
        let outcome = driver.write(position, &[event(sequence, 8)]).await.unwrap();
        assert!(outcome.accepted);
        position = outcome.next_position;
    }

    // Blob 0 is sealed; reading it populates the mirror.
    let batch = driver.read(0, 1 << 20).await.unwrap();
    assert_eq!(batch.events.len(), 10);
    let mirror = cache_dir.path().join("events.00000");
    assert!(mirror.exists());
    assert_eq!(std::fs::metadata(&mirror).unwrap().len(), 320);

    // Repeat reads serve the same bytes from the mirror.
    let again = driver.read(0, 1 << 20).await.unwrap();
    assert_eq!(again.events.len(), batch.events.len());
    for (a, b) in batch.events.iter().zip(again.events.iter()) {
        assert_eq!(a, b);
    }

    // The active blob never gets a mirror.
    assert!(!cache_dir.path().join("events.00001").exists());
}

#[tokio::test]
async fn stale_mirror_is_discarded_and_refetched() {
    let cache_dir = tempfile::tempdir().unwrap();
    let remote = MemoryObjectStore::new();
    let cached = CachedStore::open(remote.clone(), cache_dir.path()).await.unwrap();
    let config = BlobDriverConfig {
        soft_blob_cap: 64,
        compaction_threshold: 2,
        compaction_enabled: false,
    };
    let driver = BlobDriver::open(cached, config).await.unwrap();

    let mut position = 0;
    for sequence in 1u32..=4 {
        let outcome = driver.write(position, &[event(sequence, 8)]).await.unwrap();
        position = outcome.next_position;
    }
    read_all(&driver).await;

    // Corrupt the mirror by truncating it; the length check must reject it.
    let mirror = cache_dir.path().join("events.00000");
    assert!(mirror.exists());
    std::fs::write(&mirror, b"short").unwrap();

    let sequences: Vec<u32> = read_all(&driver).await.iter().map(RawEvent::sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4]);
    assert_eq!(std::fs::metadata(&mirror).unwrap().len(), 64);
}

#[tokio::test]
async fn append_blob_driver_round_trips_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsObjectStore::open(dir.path().join("backup")).await.unwrap();
    let driver = AppendBlobDriver::open(store).await.unwrap();

    assert_eq!(driver.position().await.unwrap(), 0);
    assert_eq!(driver.last_key().await.unwrap(), 0);

    let outcome = driver
        .write(0, &[event(7, 16), event(9, 16)])
        .await
        .unwrap();
    assert!(outcome.accepted);

    // A fresh driver over the same object resumes from the existing tail.
    let store = FsObjectStore::open(dir.path().join("backup")).await.unwrap();
    let reopened = AppendBlobDriver::open(store).await.unwrap();
    assert_eq!(reopened.position().await.unwrap(), outcome.next_position);
    assert_eq!(reopened.last_key().await.unwrap(), 9);

    let refused = reopened.write(0, &[event(1, 8)]).await.unwrap();
    assert!(!refused.accepted);
    assert_eq!(refused.next_position, outcome.next_position);

    let batch = reopened.read(0, 1 << 20).await.unwrap();
    let sequences: Vec<u32> = batch.events.iter().map(RawEvent::sequence).collect();
    assert_eq!(sequences, vec![7, 9]);
}

#[tokio::test]
async fn read_only_connection_string_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display().to_string();

    let writable = skiff_store_core::StoreConfig::parse(&format!(
        "AccountName={root};Container=orders"
    ))
    .unwrap();
    let driver = skiff_store_blob::open_driver(&writable).await.unwrap();
    let outcome = driver.write(0, &[event(1, 8)]).await.unwrap();
    assert!(outcome.accepted);

    let read_only = skiff_store_core::StoreConfig::parse(&format!(
        "AccountName={root};Container=orders;ReadOnly=true"
    ))
    .unwrap();
    let reader = skiff_store_blob::open_driver(&read_only).await.unwrap();
    assert_eq!(reader.last_key().await.unwrap(), 1);
    assert!(matches!(
        reader.write(outcome.next_position, &[event(2, 8)]).await,
        Err(skiff_store_core::StoreError::ReadOnly)
    ));
}
