//! The single-writer state service.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use skiff_projection::Projection;

use crate::wrapper::{
    AppendError, AppendResult, EventStreamWrapper, Transaction, WrapperError,
};

/// Tunables for [`StateService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How often the background timer requests a catch-up when nothing else
    /// has advanced the wrapper.
    pub refresh_period: Duration,
    /// Delay between initialization attempts.
    pub init_retry_delay: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(60),
            init_retry_delay: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    /// Short delays suitable for tests.
    pub fn for_tests() -> Self {
        Self {
            refresh_period: Duration::from_millis(50),
            init_retry_delay: Duration::from_millis(10),
        }
    }
}

/// Errors surfaced by the service API.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Initialization has not completed; the last failure, if any, rides
    /// along.
    #[error("service is not ready{}", failure.as_deref().map(|f| format!(": {f}")).unwrap_or_default())]
    NotReady {
        /// Most recent initialization failure.
        failure: Option<String>,
    },
    /// The writer loop has stopped.
    #[error("service is shut down")]
    ShutDown,
    /// An append failed.
    #[error(transparent)]
    Append(#[from] AppendError),
    /// A catch-up or save failed.
    #[error(transparent)]
    Wrapper(#[from] WrapperError),
    /// A save failed.
    #[error("snapshot save failed: {0}")]
    Save(String),
}

#[derive(Debug, Clone)]
enum ReadyState {
    Pending,
    Failed(String),
    /// Initialization failed fatally and will not be retried.
    Aborted(String),
    Ready,
}

type Job<P> = Box<dyn for<'a> FnOnce(&'a mut EventStreamWrapper<P>) -> BoxFuture<'a, ()> + Send>;

/// Single-writer façade over an [`EventStreamWrapper`].
///
/// One long-running task owns the wrapper; every mutation is posted onto an
/// ordered queue it consumes. [`local_state`](StateService::local_state) is
/// a lock-free read of the last published state and bypasses the queue.
pub struct StateService<P: Projection>
where
    P::Event: Clone,
{
    jobs: mpsc::UnboundedSender<Job<P>>,
    ready: watch::Receiver<ReadyState>,
    local: watch::Receiver<Option<(u32, P::State)>>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Projection> StateService<P>
where
    P::Event: Clone,
{
    /// Spawn the writer loop over `wrapper`.
    pub fn start(wrapper: EventStreamWrapper<P>, config: ServiceConfig) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);
        let (local_tx, local_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_loop(
            wrapper,
            config,
            jobs_rx,
            ready_tx,
            local_tx,
            cancel.clone(),
        ));

        Self {
            jobs: jobs_tx,
            ready: ready_rx,
            local: local_rx,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Whether initialization has completed.
    pub fn is_ready(&self) -> bool {
        matches!(*self.ready.borrow(), ReadyState::Ready)
    }

    /// The most recent initialization failure, until init succeeds.
    pub fn init_failure(&self) -> Option<String> {
        match &*self.ready.borrow() {
            ReadyState::Failed(failure) | ReadyState::Aborted(failure) => Some(failure.clone()),
            _ => None,
        }
    }

    /// Wait until the service is ready. Fails only when initialization
    /// aborted permanently or the service shut down.
    pub async fn ready(&self) -> Result<(), ServiceError> {
        let mut ready = self.ready.clone();
        loop {
            match &*ready.borrow_and_update() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Aborted(failure) => {
                    return Err(ServiceError::NotReady { failure: Some(failure.clone()) })
                }
                ReadyState::Pending | ReadyState::Failed(_) => {}
            }
            if ready.changed().await.is_err() {
                return Err(ServiceError::ShutDown);
            }
        }
    }

    /// Last state published by the writer loop, without going through the
    /// queue. Slightly stale by design.
    pub fn local_state(&self) -> Result<(u32, P::State), ServiceError> {
        self.local
            .borrow()
            .clone()
            .ok_or_else(|| self.not_ready())
    }

    /// The state after catching up with the log.
    pub async fn current_state(&self) -> Result<P::State, ServiceError> {
        let result = self
            .submit(|wrapper| {
                Box::pin(async move {
                    wrapper.catch_up().await.map(|()| wrapper.state().clone())
                })
            })
            .await?;
        result.map_err(ServiceError::from)
    }

    /// Transactional append through the writer queue; see
    /// [`EventStreamWrapper::append_events_with`].
    pub async fn append_events_with<F, T>(&self, builder: F) -> Result<AppendResult<T>, ServiceError>
    where
        F: FnMut(&P::State) -> (Vec<P::Event>, T) + Send + 'static,
        T: Send + 'static,
    {
        let result = self
            .submit(move |wrapper| Box::pin(wrapper.append_events_with(builder)))
            .await?;
        result.map_err(ServiceError::from)
    }

    /// Unconditional append through the writer queue.
    pub async fn append_events(&self, events: Vec<P::Event>) -> Result<AppendResult<()>, ServiceError> {
        let result = self
            .submit(move |wrapper| Box::pin(wrapper.append_events(events)))
            .await?;
        result.map_err(ServiceError::from)
    }

    /// Run a transaction through the writer queue; see
    /// [`EventStreamWrapper::transaction`].
    pub async fn transaction<F, T>(&self, body: F) -> Result<T, ServiceError>
    where
        F: FnMut(&mut Transaction<P>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = self
            .submit(move |wrapper| Box::pin(wrapper.transaction(body)))
            .await?;
        result.map_err(ServiceError::from)
    }

    /// Save the current state to the snapshot store.
    pub async fn try_save(&self) -> Result<bool, ServiceError> {
        let result = self
            .submit(|wrapper| Box::pin(wrapper.try_save()))
            .await?;
        result.map_err(|error| ServiceError::Save(error.to_string()))
    }

    /// Catch up with the log now.
    pub async fn catch_up(&self) -> Result<(), ServiceError> {
        let result = self
            .submit(|wrapper| Box::pin(wrapper.catch_up()))
            .await?;
        result.map_err(ServiceError::from)
    }

    /// Stop the writer loop and wait for it to finish. Pending jobs are
    /// dropped; their callers observe [`ServiceError::ShutDown`].
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        if let Some(worker) = self.worker.lock().await.take() {
            worker.await?;
        }
        info!("state service shut down");
        Ok(())
    }

    fn not_ready(&self) -> ServiceError {
        ServiceError::NotReady { failure: self.init_failure() }
    }

    /// Post a job onto the writer queue and wait for its result.
    async fn submit<T, F>(&self, run: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut EventStreamWrapper<P>) -> BoxFuture<'a, T> + Send + 'static,
    {
        if !self.is_ready() {
            return Err(self.not_ready());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job<P> = Box::new(move |wrapper| {
            Box::pin(async move {
                let value = run(wrapper).await;
                let _ = reply_tx.send(value);
            })
        });
        self.jobs.send(job).map_err(|_| ServiceError::ShutDown)?;
        reply_rx.await.map_err(|_| ServiceError::ShutDown)
    }
}

fn publish_local<P: Projection>(
    local: &watch::Sender<Option<(u32, P::State)>>,
    wrapper: &EventStreamWrapper<P>,
) where
    P::Event: Clone,
{
    let _ = local.send(Some((wrapper.sequence(), wrapper.state().clone())));
}

async fn run_loop<P: Projection>(
    mut wrapper: EventStreamWrapper<P>,
    config: ServiceConfig,
    mut jobs: mpsc::UnboundedReceiver<Job<P>>,
    ready: watch::Sender<ReadyState>,
    local: watch::Sender<Option<(u32, P::State)>>,
    cancel: CancellationToken,
) where
    P::Event: Clone,
{
    // Initialization retries forever; only a broken snapshot round-trip
    // aborts for good.
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = wrapper.initialize() => match result {
                Ok(()) => break,
                Err(WrapperError::Fatal(error)) => {
                    error!(%error, "initialization aborted permanently");
                    let _ = ready.send(ReadyState::Aborted(error.to_string()));
                    return;
                }
                Err(error) => {
                    warn!(%error, "initialization failed, retrying");
                    let _ = ready.send(ReadyState::Failed(error.to_string()));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(config.init_retry_delay) => {}
                    }
                }
            }
        }
    }
    let _ = ready.send(ReadyState::Ready);
    publish_local(&local, &wrapper);
    info!(sequence = wrapper.sequence(), "state service ready");

    let mut refresh = tokio::time::interval(config.refresh_period);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    refresh.tick().await; // the first tick completes immediately
    let mut seen_step = wrapper.sync_step();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => {
                    job(&mut wrapper).await;
                    publish_local(&local, &wrapper);
                }
                None => break,
            },
            _ = refresh.tick() => {
                // Skip the refresh when some other activity already moved
                // the wrapper since the previous tick.
                if wrapper.sync_step() == seen_step {
                    if let Err(error) = wrapper.catch_up().await {
                        warn!(%error, "periodic catch-up failed");
                    }
                    publish_local(&local, &wrapper);
                }
                seen_step = wrapper.sync_step();
            }
        }
    }
}
