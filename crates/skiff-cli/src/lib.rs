#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-cli** – Stream maintenance operations behind the `skiff` binary.
//!
//! The operations live here as plain functions so they can be exercised
//! against in-memory drivers; `main.rs` only parses arguments and wires up
//! real storage.

use tracing::{debug, info};

use skiff_store_core::{Result, StorageDriver, StoreConfig, StoreError};

/// Read window used while walking the source stream.
const BACKUP_READ_LIMIT: usize = 4 * 1024 * 1024;

/// What a backup run accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupSummary {
    /// Events copied by this run (0 when the target was already current).
    pub copied: u64,
    /// Highest sequence present in the target after the run.
    pub last_key: u32,
}

/// Copy events from `source` to `target`, preserving sequence numbers.
///
/// Resumable: the run starts after the target's highest sequence, so an
/// interrupted backup continues where it stopped. `max_key` bounds the copy
/// inclusively. The target is assumed to have a single writer; a refused
/// append means someone else is writing to it, which is an error here.
pub async fn backup_events(
    source: &dyn StorageDriver,
    target: &dyn StorageDriver,
    max_key: Option<u32>,
) -> Result<BackupSummary> {
    let resume_after = target.last_key().await?;
    let mut write_at = target.position().await?;
    let mut cursor = source.seek(resume_after.saturating_add(1)).await?;
    debug!(resume_after, cursor, "starting backup pass");

    let mut copied = 0u64;
    let mut last_key = resume_after;
    loop {
        let batch = source.read(cursor, BACKUP_READ_LIMIT).await?;
        if batch.events.is_empty() {
            break;
        }
        cursor = batch.next_position;

        let events: Vec<_> = batch
            .events
            .into_iter()
            .filter(|event| {
                event.sequence() > resume_after
                    && max_key.map(|max| event.sequence() <= max).unwrap_or(true)
            })
            .collect();
        let done = max_key
            .map(|max| events.last().map(|e| e.sequence() >= max).unwrap_or(false))
            .unwrap_or(false);
        if let Some(last) = events.last() {
            last_key = last.sequence();
        }
        if !events.is_empty() {
            let outcome = target.write(write_at, &events).await?;
            if !outcome.accepted {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "backup target advanced concurrently (expected tail {write_at}, observed {})",
                    outcome.next_position
                )));
            }
            write_at = outcome.next_position;
            copied += events.len() as u64;
        }
        if done {
            break;
        }
    }

    info!(copied, last_key, "backup pass complete");
    Ok(BackupSummary { copied, last_key })
}

/// Render a read-only connection string for `stream`.
pub fn safe_connection_string(stream: &str) -> Result<String> {
    let mut config = StoreConfig::parse(stream)?;
    config.account_key = None;
    config.read_only = true;
    Ok(config.to_connection_string())
}
