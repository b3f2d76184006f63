//! Correlation registry - routes inbound frames to the call that issued them.
//!
//! Each registered call owns one unbounded event channel. Progress frames are
//! forwarded as [`JobEvent::Progress`]; the first terminal frame removes the
//! entry and sends a single [`JobEvent::Settled`]. Because settlement removes
//! the entry, a second terminal frame for the same job finds nothing and is
//! dropped: every call settles exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::bridge::protocol::{ClientFrame, JobId, JobProgress, ServerFrame};
use crate::error::{CallError, ProtocolError, RemoteError, TransportError};
use crate::job::{JobFailure, JobOutcome, JobRequest};
use crate::tracker::JobTracker;
use crate::transport::FrameSender;

/// Event delivered to the caller of one job.
#[derive(Debug)]
pub enum JobEvent {
    Progress(JobProgress),
    Settled(Result<serde_json::Value, CallError>),
}

pub type JobEventSender = mpsc::UnboundedSender<JobEvent>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    #[error("job {0} is already registered")]
    Duplicate(JobId),
    #[error("registry is closed")]
    Closed,
}

struct PendingCall {
    method: String,
    events: JobEventSender,
    cancel_requested: bool,
}

/// Lock the registry, recovering from poison.
///
/// Entries are only ever inserted or removed whole, so a panic while holding
/// the lock cannot leave a half-settled entry behind.
pub(crate) fn lock_registry(
    registry: &Mutex<CorrelationRegistry>,
) -> MutexGuard<'_, CorrelationRegistry> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Correlation registry mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Pending calls of one connection.
pub struct CorrelationRegistry {
    pending: HashMap<JobId, PendingCall>,
    outbound: FrameSender,
    tracker: Arc<JobTracker>,
    closed: bool,
    dropped_frames: u64,
}

impl CorrelationRegistry {
    pub fn new(outbound: FrameSender, tracker: Arc<JobTracker>) -> Self {
        Self {
            pending: HashMap::new(),
            outbound,
            tracker,
            closed: false,
            dropped_frames: 0,
        }
    }

    /// Insert a pending entry and the job's `Submitted` record.
    pub fn register(
        &mut self,
        job_id: JobId,
        request: JobRequest,
        events: JobEventSender,
    ) -> Result<(), RegisterError> {
        if self.closed {
            return Err(RegisterError::Closed);
        }
        if self.pending.contains_key(&job_id) {
            tracing::error!(%job_id, "Job id registered twice");
            return Err(RegisterError::Duplicate(job_id));
        }
        tracing::debug!(%job_id, method = %request.method, "Registered call");
        self.pending.insert(
            job_id,
            PendingCall {
                method: request.method.clone(),
                events,
                cancel_requested: false,
            },
        );
        self.tracker.insert_submitted(job_id, request);
        Ok(())
    }

    /// Route one inbound frame.
    pub fn dispatch(&mut self, frame: ServerFrame) -> bool {
        match frame {
            ServerFrame::Progress { job_id, payload } => self.dispatch_progress(job_id, payload),
            ServerFrame::Result { job_id, value } => self.dispatch_result(job_id, value),
            ServerFrame::Error {
                job_id,
                code,
                message,
                detail,
            } => self.dispatch_error(
                job_id,
                RemoteError {
                    code,
                    message,
                    detail,
                },
            ),
            ServerFrame::Cancelled { job_id } => self.dispatch_cancelled(job_id),
        }
    }

    pub fn dispatch_progress(&mut self, job_id: JobId, payload: JobProgress) -> bool {
        let Some(entry) = self.pending.get(&job_id) else {
            self.drop_frame(job_id, "progress");
            return false;
        };
        // The handle may already be gone; the tracker still wants the update.
        let _ = entry.events.send(JobEvent::Progress(payload.clone()));
        self.tracker.upsert_from_progress(job_id, payload);
        true
    }

    pub fn dispatch_result(&mut self, job_id: JobId, value: serde_json::Value) -> bool {
        let Some(entry) = self.pending.remove(&job_id) else {
            self.drop_frame(job_id, "result");
            return false;
        };
        tracing::info!(%job_id, method = %entry.method, "Job done");
        self.tracker
            .upsert_from_terminal(job_id, JobOutcome::Done(value.clone()));
        settle(entry, Ok(value));
        true
    }

    pub fn dispatch_error(&mut self, job_id: JobId, error: RemoteError) -> bool {
        let Some(entry) = self.pending.remove(&job_id) else {
            self.drop_frame(job_id, "error");
            return false;
        };
        tracing::info!(
            %job_id,
            method = %entry.method,
            code = error.code,
            message = %error.message,
            "Job failed"
        );
        self.tracker.upsert_from_terminal(
            job_id,
            JobOutcome::Failed(JobFailure::Remote(error.clone())),
        );
        settle(entry, Err(CallError::Remote(error)));
        true
    }

    /// Handle a cancel acknowledgement.
    pub fn dispatch_cancelled(&mut self, job_id: JobId) -> bool {
        let Some(entry) = self.pending.remove(&job_id) else {
            self.drop_frame(job_id, "cancelled");
            return false;
        };
        if entry.cancel_requested {
            tracing::info!(%job_id, method = %entry.method, "Job cancelled");
        } else {
            tracing::warn!(%job_id, method = %entry.method, "Job cancelled without a cancel request");
        }
        self.tracker.upsert_from_terminal(job_id, JobOutcome::Cancelled);
        settle(entry, Err(CallError::Cancelled));
        true
    }

    /// Ask the service to stop a job. The entry stays pending until a
    /// terminal frame arrives. Returns true if a cancel frame was queued.
    pub fn cancel(&mut self, job_id: JobId) -> bool {
        let Some(entry) = self.pending.get_mut(&job_id) else {
            tracing::debug!(%job_id, "Cancel ignored: job not pending");
            return false;
        };
        if entry.cancel_requested {
            tracing::debug!(%job_id, "Cancel already requested");
            return false;
        }
        entry.cancel_requested = true;
        self.tracker.mark_cancel_requested(job_id);

        match self.outbound.send(ClientFrame::Cancel { job_id }) {
            Ok(()) => {
                tracing::debug!(%job_id, "Cancel requested");
                true
            }
            Err(e) => {
                // Connection loss settles the entry shortly.
                tracing::warn!(%job_id, error = %e, "Failed to send cancel");
                false
            }
        }
    }

    /// Reject every pending call with a connectivity error. Returns how many were failed.
    pub fn fail_all_pending(&mut self, error: TransportError) -> usize {
        let drained: Vec<_> = self.pending.drain().collect();
        let count = drained.len();
        for (job_id, entry) in drained {
            tracing::warn!(%job_id, method = %entry.method, "Failing call due to connection loss");
            fail_connectivity(&self.tracker, job_id, entry, error.clone());
        }
        count
    }

    /// Refuse further registrations.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.pending.contains_key(&job_id)
    }

    pub fn is_cancel_requested(&self, job_id: JobId) -> bool {
        self.pending
            .get(&job_id)
            .is_some_and(|entry| entry.cancel_requested)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Frames dropped because their job was unknown or already settled.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    fn drop_frame(&mut self, job_id: JobId, kind: &'static str) {
        // Late frames after settlement and frames for jobs never issued look
        // the same from here.
        self.dropped_frames += 1;
        let err = ProtocolError::UnknownJob { job_id, kind };
        tracing::debug!(%job_id, kind, dropped_total = self.dropped_frames, "Dropping frame: {}", err);
    }
}

fn settle(entry: PendingCall, outcome: Result<serde_json::Value, CallError>) {
    // The caller may have dropped its handle; the outcome is then discarded.
    let _ = entry.events.send(JobEvent::Settled(outcome));
}

fn fail_connectivity(tracker: &JobTracker, job_id: JobId, entry: PendingCall, error: TransportError) {
    let err = CallError::Connectivity(error);
    if let Some(failure) = JobFailure::from_call_error(&err) {
        tracker.upsert_from_terminal(job_id, JobOutcome::Failed(failure));
    }
    settle(entry, Err(err));
}
