//! A projection bound to its current state and sequence.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::quarantine::{Quarantine, QuarantinedEvent};
use crate::snapshot::{frame_snapshot, parse_snapshot, SnapshotHeader};
use crate::stores::{SnapshotCandidate, SnapshotStore};
use crate::Projection;

/// One projection plus its current state, sequence, and consistency flag.
///
/// Once any `apply` has failed, the projection is possibly inconsistent and
/// refuses to be saved: a snapshot of a state that silently skipped an event
/// would poison every later load.
pub struct ReifiedProjection<P: Projection> {
    projection: Arc<P>,
    state: P::State,
    sequence: u32,
    possibly_inconsistent: bool,
}

impl<P: Projection> Clone for ReifiedProjection<P> {
    fn clone(&self) -> Self {
        Self {
            projection: Arc::clone(&self.projection),
            state: self.state.clone(),
            sequence: self.sequence,
            possibly_inconsistent: self.possibly_inconsistent,
        }
    }
}

impl<P: Projection> ReifiedProjection<P> {
    /// Reify `projection` at its initial state.
    pub fn new(projection: Arc<P>) -> Self {
        let state = projection.initial();
        Self { projection, state, sequence: 0, possibly_inconsistent: false }
    }

    /// The projection's full name.
    pub fn name(&self) -> &str {
        self.projection.full_name()
    }

    /// Current state.
    pub fn state(&self) -> &P::State {
        &self.state
    }

    /// Sequence of the last successfully applied event.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Whether an `apply` failure has left this state possibly inconsistent.
    pub fn possibly_inconsistent(&self) -> bool {
        self.possibly_inconsistent
    }

    /// Forget everything and return to the initial state.
    pub fn reset(&mut self) {
        self.state = self.projection.initial();
        self.sequence = 0;
        self.possibly_inconsistent = false;
    }

    /// Fold one event in; a failure quarantines the event and leaves state
    /// and sequence untouched.
    pub fn apply(&mut self, sequence: u32, event: &P::Event, quarantine: &mut Quarantine<P::Event>)
    where
        P::Event: Clone,
    {
        match self.projection.apply(sequence, event, &self.state) {
            Ok(next) => {
                self.state = next;
                self.sequence = sequence;
            }
            Err(error) => {
                warn!(
                    projection = self.name(),
                    sequence,
                    %error,
                    "apply failed, quarantining event"
                );
                quarantine.push(QuarantinedEvent {
                    sequence,
                    event: Some(event.clone()),
                    error: error.to_string(),
                });
                self.possibly_inconsistent = true;
            }
        }
    }

    /// Fold one event in, propagating failures; used to pre-validate a
    /// transaction against a clone before anything is written.
    pub fn try_apply(&mut self, sequence: u32, event: &P::Event) -> anyhow::Result<()> {
        let next = self.projection.apply(sequence, event, &self.state)?;
        self.state = next;
        self.sequence = sequence;
        Ok(())
    }

    /// Note a record that never decoded into an event. The projection can
    /// no longer claim a complete history, so it stops being savable.
    pub fn quarantine_undecodable(
        &mut self,
        sequence: u32,
        error: String,
        quarantine: &mut Quarantine<P::Event>,
    ) {
        warn!(projection = self.name(), sequence, error, "quarantining undecodable record");
        quarantine.push(QuarantinedEvent { sequence, event: None, error });
        self.possibly_inconsistent = true;
    }

    /// Adopt the newest candidate this projection accepts, if any.
    ///
    /// Candidates arrive newest first; a candidate that fails to open, fails
    /// the header check, or fails the projection's own load just advances to
    /// the next one.
    pub async fn try_load(&mut self, candidates: Vec<Box<dyn SnapshotCandidate>>) -> bool {
        for candidate in candidates {
            let bytes = match candidate.read().await {
                Ok(bytes) => bytes,
                Err(error) => {
                    debug!(candidate = candidate.label(), %error, "candidate unreadable");
                    continue;
                }
            };
            let (header, body) = match parse_snapshot(&bytes) {
                Ok(parsed) => parsed,
                Err(error) => {
                    debug!(candidate = candidate.label(), %error, "candidate header damaged");
                    continue;
                }
            };
            if header.name != self.name() || header.state_type != self.projection.state_type() {
                debug!(
                    candidate = candidate.label(),
                    name = header.name,
                    state_type = header.state_type,
                    "candidate written by a different projection"
                );
                continue;
            }
            match self.projection.try_load(body) {
                Ok(state) => {
                    debug!(
                        projection = self.projection.full_name(),
                        candidate = candidate.label(),
                        sequence = header.sequence,
                        "adopted snapshot"
                    );
                    self.state = state;
                    self.sequence = header.sequence;
                    self.possibly_inconsistent = false;
                    return true;
                }
                Err(error) => {
                    debug!(candidate = candidate.label(), %error, "candidate rejected by projection");
                }
            }
        }
        false
    }

    /// Serialize the current state behind its identification header.
    /// `None` when snapshots are unsupported or the state is possibly
    /// inconsistent.
    pub fn save_to_bytes(&self) -> anyhow::Result<Option<Vec<u8>>> {
        if self.possibly_inconsistent {
            warn!(projection = self.name(), "refusing to save a possibly inconsistent state");
            return Ok(None);
        }
        let Some(body) = self.projection.try_save(&self.state)? else {
            return Ok(None);
        };
        let header = SnapshotHeader {
            name: self.name().to_string(),
            state_type: self.projection.state_type().to_string(),
            sequence: self.sequence,
        };
        Ok(Some(frame_snapshot(&header, &body)?))
    }

    /// Rebuild a reified projection from framed snapshot bytes, verifying
    /// the header. Used to prove a just-saved state actually loads.
    pub fn load_from_bytes(projection: Arc<P>, bytes: &[u8]) -> anyhow::Result<Self> {
        let (header, body) = parse_snapshot(bytes)?;
        if header.name != projection.full_name() || header.state_type != projection.state_type() {
            anyhow::bail!(
                "snapshot belongs to {:?} ({}), not {:?} ({})",
                header.name,
                header.state_type,
                projection.full_name(),
                projection.state_type()
            );
        }
        let state = projection.try_load(body)?;
        Ok(Self { projection, state, sequence: header.sequence, possibly_inconsistent: false })
    }

    /// Save the current state into `store`. Returns whether a snapshot was
    /// written.
    pub async fn try_save(&self, store: &dyn SnapshotStore) -> anyhow::Result<bool> {
        let Some(bytes) = self.save_to_bytes()? else {
            return Ok(false);
        };
        store.try_write(self.name(), &bytes).await
    }
}
