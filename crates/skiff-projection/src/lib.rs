#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **skiff-projection** – Projection layer for Skiff.
//!
//! A [`Projection`] folds events into a state; a [`ReifiedProjection`] pairs
//! one projection with its current state and sequence, quarantines events
//! whose `apply` fails, and saves/loads snapshots through a
//! [`SnapshotStore`]. Snapshot providers ship for directories, versioned
//! object-store containers, local-mirror-with-remote-fallback setups, and
//! memory.

mod quarantine;
mod reified;
mod snapshot;
mod stores;

pub use quarantine::{Quarantine, QuarantinedEvent};
pub use reified::ReifiedProjection;
pub use snapshot::{frame_snapshot, parse_snapshot, SnapshotHeader};
pub use stores::{
    DirectorySnapshotStore, MemorySnapshotStore, MirroredSnapshotStore, SnapshotCandidate,
    SnapshotStore, VersionedSnapshotStore,
};

/// A pure fold of events into a state.
///
/// `apply` must not mutate `previous`: states are cloned for transaction
/// pre-validation, and a clone must always be able to diverge from the
/// original. Persistent (structurally shared) state types keep those clones
/// cheap.
pub trait Projection: Send + Sync + 'static {
    /// Event type folded by this projection.
    type Event: Send + Sync + 'static;
    /// State produced by the fold.
    type State: Clone + Send + Sync + 'static;

    /// Stable name identifying this projection in snapshot stores.
    fn full_name(&self) -> &str;

    /// The state before any event was applied.
    fn initial(&self) -> Self::State;

    /// Fold one event into the state. An error routes the event to the
    /// quarantine and marks the projection possibly inconsistent.
    fn apply(
        &self,
        sequence: u32,
        event: &Self::Event,
        previous: &Self::State,
    ) -> anyhow::Result<Self::State>;

    /// Identifier of the state shape, embedded in snapshot headers so a
    /// snapshot written for a different state type is rejected on load.
    fn state_type(&self) -> &str {
        std::any::type_name::<Self::State>()
    }

    /// Serialize `state` for snapshotting, or `None` if this projection
    /// does not support snapshots.
    fn try_save(&self, _state: &Self::State) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Rebuild a state from bytes previously produced by `try_save`.
    fn try_load(&self, _bytes: &[u8]) -> anyhow::Result<Self::State> {
        anyhow::bail!("projection {:?} does not load snapshots", self.full_name())
    }
}
