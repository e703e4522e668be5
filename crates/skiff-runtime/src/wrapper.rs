//! The event-stream wrapper: initialization, catch-up, appends.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use skiff_projection::{Projection, Quarantine, ReifiedProjection, SnapshotStore};
use skiff_store_core::{StorageDriver, StoreError};
use skiff_stream::{EventCodec, EventStream, StreamError};

/// Tunables for [`EventStreamWrapper`].
#[derive(Debug, Clone)]
pub struct WrapperConfig {
    /// Events applied between snapshot save/reload probes during catch-up.
    pub events_between_cache_saves: u64,
    /// Attempts before a conflicted append surfaces
    /// [`AppendError::Conflict`].
    pub append_retries: u32,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self { events_between_cache_saves: 524_288, append_retries: 10 }
    }
}

/// Errors from initialization and catch-up.
#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    /// A snapshot saved cleanly but did not load back; the projection's
    /// snapshot round-trip is broken and initialization must not continue.
    #[error("snapshot saved but failed to load back: {0}")]
    Fatal(#[source] anyhow::Error),
    /// The storage driver failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the append APIs.
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// Compare-and-append kept losing; the caller may retry with fresh
    /// state.
    #[error("write conflict persisted after {attempts} attempts")]
    Conflict {
        /// How many attempts were made.
        attempts: u32,
    },
    /// The projection (or the transaction body) rejected an event during
    /// pre-apply; nothing was written.
    #[error("event rejected before write: {0}")]
    Projection(#[source] anyhow::Error),
    /// Serializing or appending the events failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Catching up before the write failed.
    #[error(transparent)]
    Wrapper(#[from] WrapperError),
}

/// What a successful append committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult<T> {
    /// Sequence assigned to the first event (the next sequence when `count`
    /// is 0).
    pub first_sequence: u32,
    /// Number of events committed.
    pub count: usize,
    /// Caller-defined value returned by the builder.
    pub extra: T,
}

type ListenerFn<E> = Box<dyn FnMut(u32, &E) + Send>;

struct Listener<E> {
    min_sequence: u32,
    callback: ListenerFn<E>,
}

/// A typed stream bound to one reified projection.
///
/// Single-threaded by ownership: exactly one task may hold the wrapper, and
/// everything here takes `&mut self`. [`StateService`](crate::StateService)
/// provides that task.
pub struct EventStreamWrapper<P: Projection>
where
    P::Event: Clone,
{
    stream: EventStream<P::Event>,
    projection: Arc<P>,
    reified: ReifiedProjection<P>,
    snapshots: Arc<dyn SnapshotStore>,
    quarantine: Quarantine<P::Event>,
    listeners: Vec<Listener<P::Event>>,
    config: WrapperConfig,
    sync_step: u64,
    events_since_save: u64,
}

impl<P: Projection> EventStreamWrapper<P>
where
    P::Event: Clone,
{
    /// Build a wrapper with an explicit event codec.
    pub fn new(
        driver: Arc<dyn StorageDriver>,
        codec: Arc<dyn EventCodec<P::Event>>,
        projection: Arc<P>,
        snapshots: Arc<dyn SnapshotStore>,
        config: WrapperConfig,
    ) -> Self {
        let reified = ReifiedProjection::new(Arc::clone(&projection));
        Self {
            stream: EventStream::new(driver, codec),
            projection,
            reified,
            snapshots,
            quarantine: Quarantine::new(),
            listeners: Vec::new(),
            config,
            sync_step: 0,
            events_since_save: 0,
        }
    }

    /// Current projection state.
    pub fn state(&self) -> &P::State {
        self.reified.state()
    }

    /// Sequence of the last applied event.
    pub fn sequence(&self) -> u32 {
        self.reified.sequence()
    }

    /// Whether a failed apply has left the state possibly inconsistent.
    pub fn possibly_inconsistent(&self) -> bool {
        self.reified.possibly_inconsistent()
    }

    /// Events whose apply (or decode) failed.
    pub fn quarantine(&self) -> &Quarantine<P::Event> {
        &self.quarantine
    }

    /// Monotonic counter bumped for every applied event; the service's
    /// refresh timer uses it to skip redundant catch-ups.
    pub fn sync_step(&self) -> u64 {
        self.sync_step
    }

    /// Observe committed events, at most once each, starting at
    /// `min_sequence`.
    pub fn subscribe(&mut self, min_sequence: u32, callback: impl FnMut(u32, &P::Event) + Send + 'static) {
        self.listeners.push(Listener { min_sequence, callback: Box::new(callback) });
    }

    /// Load the newest usable snapshot, skip the log up to it, and fold in
    /// everything after.
    ///
    /// A snapshot claiming a sequence past the end of the log belongs to a
    /// different (or corrupted) log: the stream and projection both reset
    /// and the log replays from scratch.
    pub async fn initialize(&mut self) -> Result<(), WrapperError> {
        match self.snapshots.open_read(self.reified.name()).await {
            Ok(candidates) => {
                self.reified.try_load(candidates).await;
            }
            Err(error) => {
                warn!(%error, "snapshot store unreadable, starting from the initial state");
            }
        }

        // One reset round at most: a freshly reset projection starts at
        // sequence 0 and cannot be ahead of any log.
        for _ in 0..2 {
            let start = self.reified.sequence();
            let reached = self.stream.discard_up_to(start.saturating_add(1)).await?;
            if reached < start {
                warn!(
                    snapshot = start,
                    log_end = reached,
                    "snapshot is ahead of the log, rebuilding from the initial state"
                );
                self.stream.reset();
                self.reified.reset();
                continue;
            }
            break;
        }
        self.catch_up().await
    }

    /// Fold in every remote event not yet applied, overlapping each fetch
    /// with the drain of the previous batch.
    pub async fn catch_up(&mut self) -> Result<(), WrapperError> {
        loop {
            let pending = self.stream.begin_fetch();
            self.drain();
            let batch = pending.await?;
            let more = self.stream.commit_fetch(batch);
            self.drain();
            if self.events_since_save >= self.config.events_between_cache_saves {
                self.save_probe().await?;
            }
            if !more {
                return Ok(());
            }
        }
    }

    /// Apply every queued event.
    fn drain(&mut self) {
        loop {
            match self.stream.try_get_next() {
                Ok(Some(event)) => {
                    let sequence = self.stream.sequence();
                    self.reified.apply(sequence, &event, &mut self.quarantine);
                    self.notify(sequence, &event);
                    self.sync_step += 1;
                    self.events_since_save += 1;
                }
                Ok(None) => break,
                Err(failure) => {
                    self.reified.quarantine_undecodable(
                        failure.sequence,
                        failure.source.to_string(),
                        &mut self.quarantine,
                    );
                    self.sync_step += 1;
                    self.events_since_save += 1;
                }
            }
        }
    }

    fn notify(&mut self, sequence: u32, event: &P::Event) {
        for listener in &mut self.listeners {
            if sequence >= listener.min_sequence {
                (listener.callback)(sequence, event);
            }
        }
    }

    /// Serialize the state, prove it loads back, adopt the reloaded copy,
    /// and opportunistically push it to the snapshot store.
    ///
    /// A save failure is ignored; a load failure after a clean save is
    /// fatal, because every later recovery would silently start from a
    /// snapshot that cannot be read.
    async fn save_probe(&mut self) -> Result<(), WrapperError> {
        self.events_since_save = 0;
        let bytes = match self.reified.save_to_bytes() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(error) => {
                warn!(%error, "snapshot save failed, continuing without one");
                return Ok(());
            }
        };
        match ReifiedProjection::load_from_bytes(Arc::clone(&self.projection), &bytes) {
            Ok(reloaded) if reloaded.sequence() == self.reified.sequence() => {
                self.reified = reloaded;
            }
            Ok(reloaded) => {
                return Err(WrapperError::Fatal(anyhow::anyhow!(
                    "reloaded snapshot sits at sequence {}, expected {}",
                    reloaded.sequence(),
                    self.reified.sequence()
                )));
            }
            Err(error) => return Err(WrapperError::Fatal(error)),
        }
        if let Err(error) = self.snapshots.try_write(self.reified.name(), &bytes).await {
            warn!(%error, "snapshot write failed, continuing");
        }
        Ok(())
    }

    /// Save the current state to the snapshot store, if it is savable.
    pub async fn try_save(&mut self) -> anyhow::Result<bool> {
        self.reified.try_save(self.snapshots.as_ref()).await
    }

    /// Transactional append: catch up, run `builder` against the current
    /// state, pre-apply its events to a clone, and compare-and-append.
    ///
    /// A refused append catches up and re-runs the builder, up to the
    /// configured retry bound. Builder output is pre-validated on a clone,
    /// so a rejected event propagates without committing anything.
    pub async fn append_events_with<F, T>(&mut self, mut builder: F) -> Result<AppendResult<T>, AppendError>
    where
        F: FnMut(&P::State) -> (Vec<P::Event>, T),
    {
        let attempts = self.config.append_retries.max(1);
        for attempt in 1..=attempts {
            self.catch_up().await?;
            let (events, extra) = builder(self.reified.state());

            let staged = self.pre_apply(&events)?;
            if events.is_empty() {
                return Ok(AppendResult {
                    first_sequence: self.stream.last_sequence() + 1,
                    count: 0,
                    extra,
                });
            }
            match self.stream.write(&events).await? {
                Some(first) => {
                    self.adopt_committed(staged, events.len());
                    return Ok(AppendResult { first_sequence: first, count: events.len(), extra });
                }
                None => {
                    debug!(attempt, "append refused, catching up for a retry");
                }
            }
        }
        Err(AppendError::Conflict { attempts })
    }

    /// Unconditional append: one catch-up, one attempt, conflict is an
    /// error.
    pub async fn append_events(&mut self, events: Vec<P::Event>) -> Result<AppendResult<()>, AppendError> {
        self.catch_up().await?;
        let staged = self.pre_apply(&events)?;
        if events.is_empty() {
            return Ok(AppendResult {
                first_sequence: self.stream.last_sequence() + 1,
                count: 0,
                extra: (),
            });
        }
        match self.stream.write(&events).await? {
            Some(first) => {
                self.adopt_committed(staged, events.len());
                Ok(AppendResult { first_sequence: first, count: events.len(), extra: () })
            }
            None => Err(AppendError::Conflict { attempts: 1 }),
        }
    }

    /// Run `body` against a [`Transaction`], committing its events
    /// atomically. Conflicts re-run the body on fresh state; hooks fire
    /// exactly once, on the attempt that commits or aborts.
    pub async fn transaction<F, T>(&mut self, mut body: F) -> Result<T, AppendError>
    where
        F: FnMut(&mut Transaction<P>) -> anyhow::Result<T>,
    {
        let attempts = self.config.append_retries.max(1);
        for _attempt in 1..=attempts {
            self.catch_up().await?;
            let mut tx = Transaction::new(self.reified.clone(), self.stream.last_sequence() + 1);
            let value = match body(&mut tx) {
                Ok(value) => value,
                Err(error) => {
                    tx.fire_abort();
                    return Err(AppendError::Projection(error));
                }
            };
            if tx.aborted {
                tx.fire_abort();
                return Ok(value);
            }
            if tx.events.is_empty() {
                tx.fire_commit();
                return Ok(value);
            }
            match self.stream.write(&tx.events).await? {
                Some(_) => {
                    let count = tx.events.len();
                    let Transaction { staged, on_commit, .. } = tx;
                    self.adopt_committed(staged, count);
                    for hook in on_commit {
                        hook();
                    }
                    return Ok(value);
                }
                None => {
                    // This attempt's transaction is abandoned wholesale;
                    // the next one re-registers its own hooks.
                }
            }
        }
        Err(AppendError::Conflict { attempts })
    }

    /// Validate `events` against a clone of the projection, without
    /// touching committed state.
    fn pre_apply(&self, events: &[P::Event]) -> Result<ReifiedProjection<P>, AppendError> {
        let mut staged = self.reified.clone();
        let mut sequence = self.stream.last_sequence();
        for event in events {
            sequence += 1;
            staged.try_apply(sequence, event).map_err(AppendError::Projection)?;
        }
        Ok(staged)
    }

    /// Commit a successful append: adopt the pre-applied clone and drain
    /// the stream's local copies of our own records (listeners still see
    /// them; the state does not fold them twice).
    fn adopt_committed(&mut self, staged: ReifiedProjection<P>, count: usize) {
        self.reified = staged;
        for _ in 0..count {
            match self.stream.try_get_next() {
                Ok(Some(event)) => {
                    let sequence = self.stream.sequence();
                    self.notify(sequence, &event);
                    self.sync_step += 1;
                    self.events_since_save += 1;
                }
                Ok(None) => break,
                Err(failure) => {
                    // Our own just-encoded record failed to decode; that is
                    // a codec bug, not a log problem.
                    warn!(sequence = failure.sequence, "freshly written record did not decode");
                }
            }
        }
    }
}

impl<P: Projection> EventStreamWrapper<P>
where
    P::Event: Clone + Serialize + DeserializeOwned,
{
    /// Build a wrapper with the default MessagePack codec.
    pub fn msgpack(
        driver: Arc<dyn StorageDriver>,
        projection: Arc<P>,
        snapshots: Arc<dyn SnapshotStore>,
        config: WrapperConfig,
    ) -> Self {
        Self::new(
            driver,
            Arc::new(skiff_stream::MsgPackCodec::new()),
            projection,
            snapshots,
            config,
        )
    }
}

//─────────────────────────────
//  Transactions
//─────────────────────────────

type Hook = Box<dyn FnOnce() + Send>;

/// Accumulates events against a cloned projection.
///
/// [`state`](Transaction::state) always reflects the pending events, so a
/// body can base later events on the outcome of earlier ones. Nothing
/// touches committed state until the owning wrapper writes the batch.
pub struct Transaction<P: Projection>
where
    P::Event: Clone,
{
    staged: ReifiedProjection<P>,
    events: Vec<P::Event>,
    next_sequence: u32,
    aborted: bool,
    on_commit: Vec<Hook>,
    on_abort: Vec<Hook>,
}

impl<P: Projection> Transaction<P>
where
    P::Event: Clone,
{
    fn new(staged: ReifiedProjection<P>, next_sequence: u32) -> Self {
        Self {
            staged,
            events: Vec::new(),
            next_sequence,
            aborted: false,
            on_commit: Vec::new(),
            on_abort: Vec::new(),
        }
    }

    /// Committed state plus every pending event.
    pub fn state(&self) -> &P::State {
        self.staged.state()
    }

    /// Events added so far.
    pub fn pending(&self) -> &[P::Event] {
        &self.events
    }

    /// Stage one event. A rejection leaves the transaction exactly as it
    /// was.
    pub fn add(&mut self, event: P::Event) -> anyhow::Result<()> {
        self.staged.try_apply(self.next_sequence, &event)?;
        self.next_sequence += 1;
        self.events.push(event);
        Ok(())
    }

    /// Commit zero events; the body's return value still reaches the
    /// caller.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Run `hook` once if this transaction commits.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Run `hook` once if this transaction aborts.
    pub fn on_abort(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.on_abort.push(Box::new(hook));
    }

    fn fire_commit(self) {
        for hook in self.on_commit {
            hook();
        }
    }

    fn fire_abort(self) {
        for hook in self.on_abort {
            hook();
        }
    }
}
