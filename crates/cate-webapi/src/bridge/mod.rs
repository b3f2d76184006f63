//! Wire layer between the client and the compute service.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (ClientFrame, ServerFrame) and the JobId correlation key
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
