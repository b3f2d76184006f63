//! Job records as seen by the UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{JobId, JobProgress};
use crate::error::{CallError, RemoteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    pub fn is_running(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method name and ordered arguments of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub method: String,
    pub args: Vec<serde_json::Value>,
}

impl JobRequest {
    pub fn new(method: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    Remote(RemoteError),
    Connectivity { message: String },
}

impl JobFailure {
    /// Failure record for errors that end a job; `None` for outcomes that are not failures.
    pub fn from_call_error(err: &CallError) -> Option<Self> {
        match err {
            CallError::Remote(e) => Some(Self::Remote(e.clone())),
            CallError::Connectivity(e) => Some(Self::Connectivity {
                message: e.to_string(),
            }),
            CallError::Cancelled | CallError::Transform(_) => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Remote(e) => &e.message,
            Self::Connectivity { message } => message,
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done(serde_json::Value),
    Failed(JobFailure),
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Done(_) => JobStatus::Done,
            Self::Failed(_) => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// One tracked remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub request: JobRequest,
    pub status: JobStatus,
    /// Last progress frame; replaced, never accumulated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
    /// Raw result; the caller receives the transformed value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub cancel_requested: bool,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn submitted(job_id: JobId, request: JobRequest) -> Self {
        Self {
            job_id,
            request,
            status: JobStatus::Submitted,
            progress: None,
            result: None,
            error: None,
            cancel_requested: false,
            submitted_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns false if the job already ended.
    pub fn apply_progress(&mut self, progress: JobProgress) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::InProgress;
        self.progress = Some(progress);
        true
    }

    /// Returns false if the job already ended.
    pub fn apply_outcome(&mut self, outcome: JobOutcome) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = outcome.status();
        match outcome {
            JobOutcome::Done(value) => self.result = Some(value),
            JobOutcome::Failed(error) => self.error = Some(error),
            JobOutcome::Cancelled => {}
        }
        self.completed_at = Some(Utc::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::submitted(JobId::new(1), JobRequest::new("get_data_stores", vec![]))
    }

    #[test]
    fn status_is_terminal() {
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn progress_moves_to_in_progress_and_replaces_payload() {
        let mut job = job();
        assert!(job.apply_progress(JobProgress::new("scanning").with_fraction(0.3)));
        assert_eq!(job.status, JobStatus::InProgress);
        assert!(job.apply_progress(JobProgress::new("scanning").with_fraction(0.8)));
        assert_eq!(job.progress.as_ref().and_then(|p| p.fraction), Some(0.8));
    }

    #[test]
    fn outcome_sets_terminal_fields_once() {
        let mut job = job();
        job.apply_progress(JobProgress::new("scanning").with_fraction(0.8));
        assert!(job.apply_outcome(JobOutcome::Done(json!([1, 2]))));
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.result, Some(json!([1, 2])));
        assert!(job.completed_at.is_some());
        // progress survives completion
        assert_eq!(job.progress.as_ref().and_then(|p| p.fraction), Some(0.8));

        assert!(!job.apply_outcome(JobOutcome::Cancelled));
        assert!(!job.apply_progress(JobProgress::new("late")));
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn failed_outcome_records_error() {
        let mut job = job();
        let error = RemoteError {
            code: 2,
            message: "boom".into(),
            detail: None,
        };
        job.apply_outcome(JobOutcome::Failed(JobFailure::Remote(error.clone())));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error, Some(JobFailure::Remote(error)));
        assert!(job.result.is_none());
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let failure = JobFailure::Remote(RemoteError {
            code: 7,
            message: "bad".into(),
            detail: None,
        });
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"kind": "remote", "code": 7, "message": "bad"})
        );
        let failure = JobFailure::Connectivity {
            message: "connection lost: eof".into(),
        };
        assert_eq!(failure.message(), "connection lost: eof");
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"kind": "connectivity", "message": "connection lost: eof"})
        );
    }

    #[test]
    fn status_display() {
        assert_eq!(JobStatus::InProgress.to_string(), "in_progress");
        assert_eq!(
            serde_json::to_value(JobStatus::Cancelled).unwrap(),
            json!("cancelled")
        );
    }
}
