//! cate-webapi: asynchronous job client for the Cate compute service.
//!
//! Calls go out over one framed connection. Each call gets a client-assigned
//! [`JobId`], may stream progress, can be cancelled, and settles exactly once.
//! A [`JobTracker`] keeps a UI-facing record of every job.

pub mod api;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod registry;
pub mod tracker;
pub mod transport;

pub use api::{DataSource, DataStore, DatasetApi};
pub use bridge::protocol::{JobId, JobProgress};
pub use client::{CancelHandle, JobHandle, ProgressCallback, WebApiClient};
pub use config::ClientConfig;
pub use error::{CallError, RemoteError, TransportError};
pub use job::{Job, JobFailure, JobStatus};
pub use tracker::{JobSummary, JobTracker, JobUpdate};
pub use transport::{ConnectionState, Transport};
