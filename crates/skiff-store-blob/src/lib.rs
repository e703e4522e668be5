#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-store-blob** – Multi-blob storage driver for Skiff.
//!
//! The log is partitioned across append-only objects `events.NNNNN` inside a
//! container reached through the [`ObjectStore`] seam. This crate provides:
//!
//! - [`BlobDriver`]: blob rotation at a soft size cap, a lazy first-key
//!   index for seeks, and background compaction of sealed blobs into a
//!   single `events.NNNNN.compact` blob;
//! - [`AppendBlobDriver`]: a single append-only blob, used for backups;
//! - [`FsObjectStore`] and [`MemoryObjectStore`] container implementations;
//! - [`CachedStore`]: a decorator that mirrors sealed blobs into a local
//!   directory and serves repeat reads from disk.
//!
//! [`ObjectStore`]: skiff_store_core::ObjectStore

use std::path::Path;
use std::sync::Arc;

use skiff_store_core::{ReadOnlyDriver, Result, StorageDriver, StoreConfig, StoreError};

mod append_blob;
mod cached;
mod driver;
mod fs_store;
mod memory_store;

pub use append_blob::AppendBlobDriver;
pub use cached::CachedStore;
pub use driver::{BlobDriver, BlobDriverConfig};
pub use fs_store::FsObjectStore;
pub use memory_store::MemoryObjectStore;

/// Open the storage driver described by a parsed connection string.
///
/// `ConnectionString` (or `AccountName`) resolves to a filesystem root and
/// `Container` to the directory holding the stream's blobs. `ReadOnly=true`
/// wraps the driver so writes are refused.
pub async fn open_driver(config: &StoreConfig) -> Result<Arc<dyn StorageDriver>> {
    let root = config
        .root()
        .ok_or_else(|| StoreError::Config("no ConnectionString or AccountName".into()))?;
    let mut path = Path::new(root).to_path_buf();
    if let Some(container) = &config.container {
        path.push(container);
    }
    let store = FsObjectStore::open(&path).await?;
    let driver = BlobDriver::open(store, BlobDriverConfig::default()).await?;
    if config.read_only {
        Ok(Arc::new(ReadOnlyDriver::new(driver)))
    } else {
        Ok(Arc::new(driver))
    }
}
