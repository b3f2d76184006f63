//! Error types surfaced to callers.
//!
//! Every call settles with exactly one of: a value, [`CallError::Remote`],
//! [`CallError::Cancelled`], [`CallError::Transform`] or [`CallError::Connectivity`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::protocol::JobId;
use crate::transport::ConnectionState;

/// Error reported by the service for one job, passed through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection is {0}, not open")]
    NotOpen(ConnectionState),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    /// Refused locally; the connection is unaffected.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("call refused: {0}")]
    Refused(String),
}

/// A frame that could not be routed or understood.
///
/// Never surfaced to callers: the dispatch loop logs and drops these.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{kind} frame for unknown job {job_id}")]
    UnknownJob { job_id: JobId, kind: &'static str },
}

/// Outcome of a call that did not produce a value.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("connectivity error: {0}")]
    Connectivity(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("job was cancelled")]
    Cancelled,

    #[error("failed to transform result: {0:#}")]
    Transform(#[source] anyhow::Error),
}

impl CallError {
    /// Cancellation is an expected outcome for callers that asked for it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_display() {
        let err = CallError::Remote(RemoteError {
            code: 500,
            message: "operation failed".to_string(),
            detail: None,
        });
        assert_eq!(err.to_string(), "remote error 500: operation failed");

        let err = CallError::Connectivity(TransportError::NotOpen(ConnectionState::Closed));
        assert_eq!(
            err.to_string(),
            "connectivity error: connection is closed, not open"
        );

        assert_eq!(CallError::Cancelled.to_string(), "job was cancelled");
    }

    #[test]
    fn transform_error_keeps_cause_chain() {
        let cause = anyhow::anyhow!("missing field `id`").context("bad data source");
        let err = CallError::Transform(cause);
        assert_eq!(
            err.to_string(),
            "failed to transform result: bad data source: missing field `id`"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn classification_helpers() {
        assert!(CallError::Cancelled.is_cancelled());
        assert!(
            CallError::Connectivity(TransportError::ConnectionLost("eof".into())).is_connectivity()
        );
        let remote = RemoteError {
            code: 1,
            message: "x".into(),
            detail: None,
        };
        assert_eq!(CallError::from(remote.clone()).remote(), Some(&remote));
        assert!(CallError::Cancelled.remote().is_none());
    }
}
