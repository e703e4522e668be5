//! Backup behavior: full copies, resumption, sequence bounds.

use bytes::Bytes;

use skiff_cli::backup_events;
use skiff_store_core::{RawEvent, StorageDriver};
use skiff_store_memory::MemoryDriver;

fn event(sequence: u32) -> RawEvent {
    RawEvent::new(sequence, Bytes::from(sequence.to_le_bytes().repeat(2))).unwrap()
}

async fn seed(driver: &MemoryDriver, sequences: impl IntoIterator<Item = u32>) {
    let events: Vec<RawEvent> = sequences.into_iter().map(event).collect();
    let at = driver.position().await.unwrap();
    let outcome = driver.write(at, &events).await.unwrap();
    assert!(outcome.accepted);
}

async fn sequences_of(driver: &MemoryDriver) -> Vec<u32> {
    let batch = driver.read(0, 1 << 20).await.unwrap();
    batch.events.iter().map(RawEvent::sequence).collect()
}

#[tokio::test]
async fn copies_everything_and_preserves_sequences() {
    let source = MemoryDriver::new();
    let target = MemoryDriver::new();
    seed(&source, 1..=20).await;

    let summary = backup_events(&source, &target, None).await.unwrap();
    assert_eq!(summary.copied, 20);
    assert_eq!(summary.last_key, 20);
    assert_eq!(sequences_of(&target).await, (1..=20).collect::<Vec<u32>>());
}

#[tokio::test]
async fn resumes_after_the_targets_last_key() {
    let source = MemoryDriver::new();
    let target = MemoryDriver::new();
    seed(&source, 1..=10).await;

    backup_events(&source, &target, None).await.unwrap();

    // The source grows; a second pass copies only the new tail.
    seed(&source, 11..=15).await;
    let summary = backup_events(&source, &target, None).await.unwrap();
    assert_eq!(summary.copied, 5);
    assert_eq!(summary.last_key, 15);
    assert_eq!(sequences_of(&target).await, (1..=15).collect::<Vec<u32>>());

    // Nothing new: the pass is a no-op.
    let summary = backup_events(&source, &target, None).await.unwrap();
    assert_eq!(summary.copied, 0);
}

#[tokio::test]
async fn max_sequence_bounds_the_copy() {
    let source = MemoryDriver::new();
    let target = MemoryDriver::new();
    seed(&source, 1..=10).await;

    let summary = backup_events(&source, &target, Some(4)).await.unwrap();
    assert_eq!(summary.copied, 4);
    assert_eq!(summary.last_key, 4);
    assert_eq!(sequences_of(&target).await, vec![1, 2, 3, 4]);

    // Raising the bound resumes from where the previous run stopped.
    let summary = backup_events(&source, &target, Some(7)).await.unwrap();
    assert_eq!(summary.copied, 3);
    assert_eq!(sequences_of(&target).await, (1..=7).collect::<Vec<u32>>());
}
