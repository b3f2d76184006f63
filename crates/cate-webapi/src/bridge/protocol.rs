//! Wire protocol types for client-service communication.
//!
//! Two directions:
//! - **Client frames**: Call, Cancel
//! - **Server frames**: Progress, Result, Error, Cancelled (the cancel acknowledgement)
//!
//! Every frame carries the `job_id` it belongs to. Correlation is by id only,
//! never by arrival order.

use serde::{Deserialize, Serialize};

/// Correlation id for one remote call.
///
/// Assigned by the client, monotonically, and never reused within a client's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last-seen progress of a running job.
///
/// A missing `fraction` means the service cannot estimate completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fraction: None,
            message: None,
        }
    }

    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = Some(fraction);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_indeterminate(&self) -> bool {
        self.fraction.is_none_or(f64::is_nan)
    }

    /// Completion clamped into `0.0..=1.0`, `None` when indeterminate.
    pub fn completion(&self) -> Option<f64> {
        self.fraction
            .filter(|f| !f.is_nan())
            .map(|f| f.clamp(0.0, 1.0))
    }
}

/// Frames sent from client to service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Call {
        job_id: JobId,
        method: String,
        args: Vec<serde_json::Value>,
    },

    /// Request to stop a running job. The service answers with `Cancelled`
    /// or, if it loses the race, with a regular terminal frame.
    Cancel { job_id: JobId },
}

impl ClientFrame {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Call { job_id, .. } | Self::Cancel { job_id } => *job_id,
        }
    }
}

/// Frames sent from service to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Progress {
        job_id: JobId,
        payload: JobProgress,
    },

    Result {
        job_id: JobId,
        #[serde(default)]
        value: serde_json::Value,
    },

    Error {
        job_id: JobId,
        code: i64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<serde_json::Value>,
    },

    /// Acknowledges a `Cancel`: the job stopped without a result.
    Cancelled { job_id: JobId },
}

impl ServerFrame {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::Progress { job_id, .. }
            | Self::Result { job_id, .. }
            | Self::Error { job_id, .. }
            | Self::Cancelled { job_id } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}
