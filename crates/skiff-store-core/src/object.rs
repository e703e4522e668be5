//! The object-store seam behind the multi-blob driver.
//!
//! Cloud SDK bindings stay outside the core; drivers talk to containers of
//! append-only objects through this trait. Filesystem and in-memory
//! implementations live in `skiff-store-blob`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Name and length of one object in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object name within the container.
    pub name: String,
    /// Current object length in bytes.
    pub len: u64,
}

/// Outcome of a conditional append at the object level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAppend {
    /// Whether the append happened.
    pub accepted: bool,
    /// Object length after the call: `expected_len + data.len()` on success,
    /// the observed length on refusal.
    pub new_len: u64,
}

/// A container of append-only objects with conditional appends and an atomic
/// publish step.
///
/// Implementations must serialize their own appends per object; concurrent
/// reads must not interfere with writes.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Every object in the container, in no particular order.
    async fn list(&self) -> Result<Vec<ObjectMeta>>;

    /// Length of `name`, or `None` if it does not exist.
    async fn len(&self, name: &str) -> Result<Option<u64>>;

    /// Up to `limit` bytes of `name` starting at `offset`; short reads only
    /// at end of object.
    async fn read_range(&self, name: &str, offset: u64, limit: usize) -> Result<Bytes>;

    /// Append `data` to `name` only if the object's current length equals
    /// `expected_len`. Creates the object when `expected_len` is 0 and it
    /// does not exist. A refused append is not an error.
    async fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> Result<ObjectAppend>;

    /// Create an empty object, replacing any existing one.
    async fn create(&self, name: &str) -> Result<()>;

    /// Delete an object; deleting a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Atomically publish the staged object `staged` under `name`.
    async fn publish(&self, staged: &str, name: &str) -> Result<()>;

    /// Advisory: `name` will never change again. Caching decorators use this
    /// to decide what is safe to mirror; plain stores ignore it.
    fn hint_sealed(&self, _name: &str) {}
}

#[async_trait]
impl<S: ObjectStore + ?Sized> ObjectStore for std::sync::Arc<S> {
    async fn list(&self) -> Result<Vec<ObjectMeta>> {
        (**self).list().await
    }

    async fn len(&self, name: &str) -> Result<Option<u64>> {
        (**self).len(name).await
    }

    async fn read_range(&self, name: &str, offset: u64, limit: usize) -> Result<Bytes> {
        (**self).read_range(name, offset, limit).await
    }

    async fn append(&self, name: &str, expected_len: u64, data: &[u8]) -> Result<ObjectAppend> {
        (**self).append(name, expected_len, data).await
    }

    async fn create(&self, name: &str) -> Result<()> {
        (**self).create(name).await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        (**self).delete(name).await
    }

    async fn publish(&self, staged: &str, name: &str) -> Result<()> {
        (**self).publish(staged, name).await
    }

    fn hint_sealed(&self, name: &str) {
        (**self).hint_sealed(name)
    }
}
