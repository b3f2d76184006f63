//! Job tracker - the UI-facing view of every call.
//!
//! A passive observer: the correlation registry feeds it lifecycle events, the
//! UI reads snapshots or subscribes to updates. Nothing here touches pending
//! calls, so removing a record can never orphan or settle a future.

use std::collections::BTreeMap;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::bridge::protocol::{JobId, JobProgress};
use crate::job::{Job, JobOutcome, JobRequest, JobStatus};

/// Default capacity of the update broadcast buffer.
pub const DEFAULT_UPDATE_CAPACITY: usize = 256;

/// Change notification for subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobUpdate {
    Changed { job_id: JobId, status: JobStatus },
    Removed { job_id: JobId },
}

impl JobUpdate {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Changed { job_id, .. } | Self::Removed { job_id } => *job_id,
        }
    }
}

/// Counts of jobs worth showing in a status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Submitted or in progress.
    pub running: usize,
    /// Failed or cancelled.
    pub failed: usize,
}

impl JobSummary {
    /// Status line text, `None` when there is nothing to report.
    pub fn message(&self) -> Option<String> {
        match (self.running, self.failed) {
            (0, 0) => None,
            (running, 0) => Some(format!("{running} running task(s)")),
            (0, failed) => Some(format!("{failed} failed task(s)")),
            (running, failed) => Some(format!("{running} running / {failed} failed task(s)")),
        }
    }
}

/// Process-wide job table.
pub struct JobTracker {
    jobs: DashMap<JobId, Job>,
    updates: broadcast::Sender<JobUpdate>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_UPDATE_CAPACITY)
    }

    pub fn with_capacity(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            jobs: DashMap::new(),
            updates,
        }
    }

    /// Subscribe to change notifications. Slow receivers may observe `Lagged`
    /// and should fall back to [`JobTracker::snapshot`].
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    pub fn insert_submitted(&self, job_id: JobId, request: JobRequest) {
        self.jobs.insert(job_id, Job::submitted(job_id, request));
        self.notify(JobUpdate::Changed {
            job_id,
            status: JobStatus::Submitted,
        });
    }

    /// Record a progress frame. Ignored for unknown or finished jobs.
    pub fn upsert_from_progress(&self, job_id: JobId, progress: JobProgress) -> bool {
        let applied = match self.jobs.get_mut(&job_id) {
            Some(mut job) => job.apply_progress(progress),
            None => false,
        };
        if applied {
            self.notify(JobUpdate::Changed {
                job_id,
                status: JobStatus::InProgress,
            });
        } else {
            tracing::debug!(%job_id, "Ignoring progress for untracked or finished job");
        }
        applied
    }

    /// Record how a job ended. Ignored for unknown or finished jobs.
    pub fn upsert_from_terminal(&self, job_id: JobId, outcome: JobOutcome) -> bool {
        let status = outcome.status();
        let applied = match self.jobs.get_mut(&job_id) {
            Some(mut job) => job.apply_outcome(outcome),
            None => false,
        };
        if applied {
            tracing::debug!(%job_id, %status, "Job finished");
            self.notify(JobUpdate::Changed { job_id, status });
        } else {
            tracing::debug!(%job_id, %status, "Ignoring outcome for untracked or finished job");
        }
        applied
    }

    pub fn mark_cancel_requested(&self, job_id: JobId) -> bool {
        let status = match self.jobs.get_mut(&job_id) {
            Some(mut job) if !job.is_terminal() => {
                job.cancel_requested = true;
                job.status
            }
            _ => return false,
        };
        self.notify(JobUpdate::Changed { job_id, status });
        true
    }

    /// Drop a finished job's record. No-op while the job is still running:
    /// in-flight work can only be cancelled, not forgotten.
    pub fn remove_job(&self, job_id: JobId) -> bool {
        let removed = self
            .jobs
            .remove_if(&job_id, |_, job| job.is_terminal())
            .is_some();
        if removed {
            self.notify(JobUpdate::Removed { job_id });
        } else {
            tracing::debug!(%job_id, "remove_job ignored: job unknown or still running");
        }
        removed
    }

    /// Drop every finished job's record, returning how many were removed.
    pub fn remove_terminal_jobs(&self) -> usize {
        let finished: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_terminal())
            .map(|entry| *entry.key())
            .collect();
        finished
            .into_iter()
            .filter(|job_id| self.remove_job(*job_id))
            .count()
    }

    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.jobs.get(&job_id).map(|job| job.clone())
    }

    pub fn status(&self, job_id: JobId) -> Option<JobStatus> {
        self.jobs.get(&job_id).map(|job| job.status)
    }

    /// Read-only copy of all records, ordered by job id.
    pub fn snapshot(&self) -> BTreeMap<JobId, Job> {
        self.jobs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn summary(&self) -> JobSummary {
        let mut summary = JobSummary::default();
        for entry in self.jobs.iter() {
            match entry.status {
                JobStatus::Submitted | JobStatus::InProgress => summary.running += 1,
                JobStatus::Failed | JobStatus::Cancelled => summary.failed += 1,
                JobStatus::Done => {}
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn notify(&self, update: JobUpdate) {
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}
