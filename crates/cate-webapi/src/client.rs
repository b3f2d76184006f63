//! RPC client - issues calls and hands back cancellable job handles.
//!
//! A [`WebApiClient`] owns one [`Session`] at a time: the transport's sender,
//! the correlation registry for that connection, and the dispatch task that
//! drains transport events into the registry. The job id counter and the
//! [`JobTracker`] live on the client and outlive sessions.

use std::collections::BTreeMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::bridge::protocol::{ClientFrame, JobId, JobProgress};
use crate::config::ClientConfig;
use crate::error::{CallError, TransportError};
use crate::job::{Job, JobRequest};
use crate::registry::{CorrelationRegistry, JobEvent, lock_registry};
use crate::tracker::{JobSummary, JobTracker, JobUpdate};
use crate::transport::{ConnectionState, FrameSender, Transport, TransportEvent};

/// Progress callback, invoked once per progress frame on the awaiting task.
pub type ProgressCallback = Box<dyn FnMut(&JobProgress) + Send>;

type Transform<T> = Box<dyn FnOnce(Value) -> anyhow::Result<T> + Send>;

/// One connection's worth of state.
struct Session {
    number: u64,
    sender: FrameSender,
    registry: Arc<Mutex<CorrelationRegistry>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn start(number: u64, transport: Transport, tracker: Arc<JobTracker>) -> Self {
        let (sender, events) = transport.into_parts();
        let registry = Arc::new(Mutex::new(CorrelationRegistry::new(sender.clone(), tracker)));
        let dispatch = tokio::spawn(run_dispatch_loop(number, events, Arc::clone(&registry)));
        tracing::debug!(session = number, "Session started");
        Self {
            number,
            sender,
            registry,
            dispatch: Mutex::new(Some(dispatch)),
        }
    }

    /// Close the connection and wait until every pending call has settled.
    async fn stop(&self) {
        self.sender.close();
        let dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatch) = dispatch
            && let Err(e) = dispatch.await
        {
            tracing::error!(session = self.number, error = %e, "Dispatch task failed");
        }
        // Covers a dispatch task that ended without seeing the state change.
        let mut registry = lock_registry(&self.registry);
        registry.fail_all_pending(TransportError::NotOpen(self.sender.state()));
        registry.close();
    }
}

/// Drain transport events into the registry, one at a time in arrival order.
async fn run_dispatch_loop(
    session: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    registry: Arc<Mutex<CorrelationRegistry>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(frame) => {
                lock_registry(&registry).dispatch(frame);
            }
            TransportEvent::StateChanged { state, reason } => {
                let mut registry = lock_registry(&registry);
                let failed =
                    registry.fail_all_pending(TransportError::ConnectionLost(reason.clone()));
                registry.close();
                if failed > 0 {
                    tracing::warn!(session, %state, %reason, failed, "Connection down, failed pending calls");
                } else {
                    tracing::info!(session, %state, %reason, "Connection down");
                }
                return;
            }
        }
    }
    tracing::debug!(session, "Transport event stream ended");
}

/// Client for the compute service's job API.
pub struct WebApiClient {
    session: RwLock<Arc<Session>>,
    tracker: Arc<JobTracker>,
    next_job_id: AtomicU64,
    sessions: AtomicU64,
    config: ClientConfig,
}

impl WebApiClient {
    /// Wrap an open transport. Must be called inside a tokio runtime.
    pub fn new(transport: Transport) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Transport, config: ClientConfig) -> Self {
        let tracker = Arc::new(JobTracker::with_capacity(config.update_capacity));
        let session = Session::start(1, transport, Arc::clone(&tracker));
        Self {
            session: RwLock::new(Arc::new(session)),
            tracker,
            next_job_id: AtomicU64::new(1),
            sessions: AtomicU64::new(1),
            config,
        }
    }

    pub async fn connect(config: ClientConfig) -> Result<Self, TransportError> {
        let transport = Transport::connect(&config).await?;
        Ok(Self::with_config(transport, config))
    }

    pub async fn connect_with_retry(
        config: ClientConfig,
        max_attempts: u32,
    ) -> Result<Self, TransportError> {
        let transport = Transport::connect_with_retry(&config, max_attempts).await?;
        Ok(Self::with_config(transport, config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn current_session(&self) -> Arc<Session> {
        Arc::clone(&self.session.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Issue a call.
    ///
    /// Fails immediately with a connectivity error if the connection is not
    /// open or the call frame exceeds the frame length limit; nothing is
    /// registered or tracked in that case and other calls are unaffected.
    /// Otherwise the job is tracked as `Submitted` and the returned handle
    /// settles exactly once.
    pub fn call<T, F>(
        &self,
        method: &str,
        args: Vec<Value>,
        on_progress: Option<ProgressCallback>,
        transform: F,
    ) -> Result<JobHandle<T>, CallError>
    where
        F: FnOnce(Value) -> anyhow::Result<T> + Send + 'static,
    {
        let session = self.current_session();
        let job_id = JobId::new(self.next_job_id.fetch_add(1, Ordering::Relaxed));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            // Held across send and register: the dispatch loop cannot route a
            // reply or fail pending calls until the entry exists.
            let mut registry = lock_registry(&session.registry);
            if registry.is_closed() {
                let state = session.sender.state();
                tracing::debug!(method, %state, "Call refused: connection not open");
                return Err(TransportError::NotOpen(state).into());
            }
            if registry.is_pending(job_id) {
                tracing::error!(%job_id, method, "Job id allocated twice");
                return Err(TransportError::Refused(format!("job id {job_id} already in use")).into());
            }

            let frame = ClientFrame::Call {
                job_id,
                method: method.to_string(),
                args: args.clone(),
            };
            if let Err(e) = session.sender.send(frame) {
                tracing::debug!(%job_id, method, error = %e, "Call refused");
                return Err(e.into());
            }

            if let Err(e) = registry.register(job_id, JobRequest::new(method, args), events_tx) {
                tracing::error!(%job_id, method, error = %e, "Sent call could not be registered");
                return Err(TransportError::Refused(e.to_string()).into());
            }
        }
        tracing::debug!(%job_id, method, session = session.number, "Call sent");

        Ok(JobHandle {
            job_id,
            events: events_rx,
            settled: None,
            on_progress,
            transform: Box::new(transform),
            canceller: CancelHandle {
                job_id,
                registry: Arc::clone(&session.registry),
            },
        })
    }

    /// Call returning the raw JSON result.
    pub fn call_json(&self, method: &str, args: Vec<Value>) -> Result<JobHandle<Value>, CallError> {
        self.call(method, args, None, Ok)
    }

    /// Request cancellation of a pending job. Returns false if the job is not
    /// pending on the current connection or was already asked to cancel.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let session = self.current_session();
        lock_registry(&session.registry).cancel(job_id)
    }

    /// Drop a terminal job record. Running jobs are left alone.
    pub fn remove_job(&self, job_id: JobId) -> bool {
        self.tracker.remove_job(job_id)
    }

    pub fn remove_terminal_jobs(&self) -> usize {
        self.tracker.remove_terminal_jobs()
    }

    pub fn jobs(&self) -> BTreeMap<JobId, Job> {
        self.tracker.snapshot()
    }

    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.tracker.get(job_id)
    }

    pub fn summary(&self) -> JobSummary {
        self.tracker.summary()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.tracker.subscribe()
    }

    pub fn tracker(&self) -> &Arc<JobTracker> {
        &self.tracker
    }

    /// Calls awaiting a terminal frame on the current connection.
    pub fn pending_calls(&self) -> usize {
        lock_registry(&self.current_session().registry).pending_count()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.current_session().sender.state()
    }

    /// State receiver for the current connection. A replaced connection's
    /// receiver ends in `closed`.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.current_session().sender.watch_state()
    }

    /// Install a new connection. Calls pending on the old one fail with a
    /// connectivity error; job ids keep counting from where they were.
    pub async fn replace_transport(&self, transport: Transport) {
        let number = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(Session::start(number, transport, Arc::clone(&self.tracker)));
        let old = {
            let mut current = self.session.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, session)
        };
        tracing::info!(old = old.number, new = number, "Replacing transport");
        old.stop().await;
    }

    /// Close the connection. Returns once every pending call has settled.
    pub async fn shutdown(&self) {
        let session = self.current_session();
        tracing::info!(session = session.number, "Shutting down client");
        session.stop().await;
    }
}

impl Drop for WebApiClient {
    fn drop(&mut self) {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .close();
    }
}

/// Cloneable cancellation path for one job.
#[derive(Clone)]
pub struct CancelHandle {
    job_id: JobId,
    registry: Arc<Mutex<CorrelationRegistry>>,
}

impl CancelHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Fire-and-forget: the job settles when the service answers.
    pub fn cancel(&self) -> bool {
        lock_registry(&self.registry).cancel(self.job_id)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Handle to an issued call. Await it (or call [`JobHandle::result`]) for the
/// transformed value.
pub struct JobHandle<T> {
    job_id: JobId,
    events: mpsc::UnboundedReceiver<JobEvent>,
    settled: Option<Result<Value, CallError>>,
    on_progress: Option<ProgressCallback>,
    transform: Transform<T>,
    canceller: CancelHandle,
}

impl<T> JobHandle<T> {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn cancel(&self) -> bool {
        self.canceller.cancel()
    }

    pub fn canceller(&self) -> CancelHandle {
        self.canceller.clone()
    }

    /// Replace the progress callback.
    pub fn on_progress(mut self, callback: impl FnMut(&JobProgress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Next progress payload, or `None` once the job has settled. Pulling
    /// progress this way bypasses the callback.
    pub async fn next_progress(&mut self) -> Option<JobProgress> {
        if self.settled.is_some() {
            return None;
        }
        match self.events.recv().await {
            Some(JobEvent::Progress(progress)) => Some(progress),
            Some(JobEvent::Settled(outcome)) => {
                self.settled = Some(outcome);
                None
            }
            None => {
                self.settled = Some(Err(dropped_without_result()));
                None
            }
        }
    }

    /// Wait for the terminal outcome, feeding progress to the callback.
    pub async fn result(mut self) -> Result<T, CallError> {
        let job_id = self.job_id;
        let outcome = loop {
            if let Some(settled) = self.settled.take() {
                break settled;
            }
            match self.events.recv().await {
                Some(JobEvent::Progress(progress)) => {
                    if let Some(callback) = self.on_progress.as_mut() {
                        callback(&progress);
                    }
                }
                Some(JobEvent::Settled(outcome)) => break outcome,
                None => break Err(dropped_without_result()),
            }
        };

        let value = outcome?;
        (self.transform)(value).map_err(|e| {
            tracing::warn!(%job_id, error = %format!("{e:#}"), "Result transform failed");
            CallError::Transform(e)
        })
    }
}

fn dropped_without_result() -> CallError {
    CallError::Connectivity(TransportError::ConnectionLost(
        "job dropped without a result".to_string(),
    ))
}

impl<T: Send + 'static> IntoFuture for JobHandle<T> {
    type Output = Result<T, CallError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.result())
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.job_id)
            .field("settled", &self.settled.is_some())
            .finish()
    }
}
