//! Transport - one long-lived framed connection to the compute service.
//!
//! Flow:
//! 1. Split the stream into a framed reader and a framed writer
//! 2. Writer task drains an unbounded outbound queue, preserving send order
//! 3. Reader task decodes inbound frames and forwards them as [`TransportEvent`]s
//! 4. First failure (EOF, I/O, decode) or `close()` moves the state to
//!    `error`/`closed`, emits one state event, and stops both tasks
//!
//! The transport never looks inside a frame beyond checking that it is a
//! known frame shape.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{ClientFrame, ServerFrame};
use crate::config::ClientConfig;
use crate::error::{ProtocolError, TransportError};

/// Lifecycle of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Error,
    Closed,
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Error and Closed are final for a transport.
    pub fn is_down(&self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Error => "error",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound events, delivered in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(ServerFrame),
    /// The connection went down. Emitted once, after every frame read before it.
    StateChanged {
        state: ConnectionState,
        reason: String,
    },
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Move to a down state. Only the first call wins.
    fn go_down(&self, state: ConnectionState, reason: impl Into<String>) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if current.is_down() {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let _ = self.events_tx.send(TransportEvent::StateChanged {
                state,
                reason: reason.into(),
            });
        }
        self.shutdown.cancel();
        changed
    }
}

/// Cloneable handle for sending frames and observing connection state.
#[derive(Clone)]
pub struct FrameSender {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    state: watch::Receiver<ConnectionState>,
    max_frame_length: usize,
    shared: Arc<Shared>,
}

impl FrameSender {
    /// Queue a frame for writing. Fails unless the connection is open.
    ///
    /// Frames over the length limit are refused here, so the connection and
    /// other callers' frames are unaffected.
    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let state = self.state();
        if !state.is_open() {
            return Err(TransportError::NotOpen(state));
        }
        self.check_frame_length(&frame)?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost("writer stopped".to_string()))
    }

    /// Refuse a frame whose encoded body exceeds the limit.
    fn check_frame_length(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        let size = serde_json::to_vec(frame)
            .map_err(|e| TransportError::Encode(e.to_string()))?
            .len();
        if size > self.max_frame_length {
            tracing::warn!(
                job_id = %frame.job_id(),
                size,
                limit = self.max_frame_length,
                "Refusing oversized frame"
            );
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_frame_length,
            });
        }
        Ok(())
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        if self.shared.go_down(ConnectionState::Closed, "closed by client") {
            tracing::debug!("Transport closed by client");
        }
    }
}

/// Owned connection: a [`FrameSender`] plus the inbound event stream.
pub struct Transport {
    sender: FrameSender,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// Wrap an already-connected stream. Must be called inside a tokio runtime.
    pub fn from_stream<S>(stream: S, max_frame_length: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(
            read_half,
            JsonCodec::<serde_json::Value>::with_max_frame_length(max_frame_length),
        );
        let writer = FramedWrite::new(
            write_half,
            JsonCodec::<ClientFrame>::with_max_frame_length(max_frame_length),
        );

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            state_tx,
            events_tx,
            shutdown: CancellationToken::new(),
        });

        // Open before the tasks start so an early failure cannot be overwritten.
        shared.state_tx.send_replace(ConnectionState::Open);
        tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&shared)));
        tracing::debug!("Transport open");

        Self {
            sender: FrameSender {
                outbound: outbound_tx,
                state: state_rx,
                max_frame_length,
                shared,
            },
            events: events_rx,
        }
    }

    /// Open a TCP connection to `config.address`.
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        let connect_err = |reason: String| TransportError::Connect {
            address: config.address.clone(),
            reason,
        };

        tracing::info!(address = %config.address, "Connecting to compute service");
        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(config.address.as_str()),
        )
        .await
        .map_err(|_| {
            connect_err(format!(
                "timed out after {:.1}s",
                config.connect_timeout.as_secs_f64()
            ))
        })?
        .map_err(|e| connect_err(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not disable Nagle");
        }

        Ok(Self::from_stream(stream, config.max_frame_length))
    }

    /// Connect with exponential backoff: 100ms, 200ms, 400ms, ...
    ///
    /// Only the connection attempt is retried; calls are never retried.
    pub async fn connect_with_retry(
        config: &ClientConfig,
        max_attempts: u32,
    ) -> Result<Self, TransportError> {
        let mut last_error = None;

        for attempt in 1..=max_attempts.max(1) {
            match Self::connect(config).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    tracing::warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                    last_error = Some(e);
                    if attempt < max_attempts {
                        let delay = Duration::from_millis(100 * (1 << (attempt - 1).min(10)));
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| TransportError::Connect {
            address: config.address.clone(),
            reason: "no attempts made".to_string(),
        }))
    }

    pub fn sender(&self) -> &FrameSender {
        &self.sender
    }

    pub fn state(&self) -> ConnectionState {
        self.sender.state()
    }

    pub fn send(&self, frame: ClientFrame) -> Result<(), TransportError> {
        self.sender.send(frame)
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (FrameSender, mpsc::UnboundedReceiver<TransportEvent>) {
        (self.sender, self.events)
    }
}

async fn read_loop<R>(mut reader: FramedRead<R, JsonCodec<serde_json::Value>>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,

            next = reader.next() => {
                match next {
                    Some(Ok(value)) => match serde_json::from_value::<ServerFrame>(value) {
                        Ok(frame) => {
                            tracing::trace!(job_id = %frame.job_id(), kind = frame.kind(), "Frame received");
                            if shared.events_tx.send(TransportEvent::Frame(frame)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let err = ProtocolError::Malformed(e);
                            tracing::warn!(error = %err, "Dropping malformed frame");
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Connection error");
                        shared.go_down(ConnectionState::Error, e.to_string());
                        break;
                    }
                    None => {
                        tracing::info!("Connection closed by service");
                        shared.go_down(ConnectionState::Closed, "connection closed by service");
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!("Transport reader exiting");
}

async fn write_loop<W>(
    mut writer: FramedWrite<W, JsonCodec<ClientFrame>>,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shared.shutdown.cancelled() => break,

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let job_id = frame.job_id();
                if let Err(e) = writer.send(frame).await {
                    tracing::warn!(%job_id, error = %e, "Failed to write frame");
                    shared.go_down(ConnectionState::Error, format!("write failed: {e}"));
                    break;
                }
            }
        }
    }
    if let Err(e) = writer.close().await {
        tracing::debug!(error = %e, "Error shutting down writer");
    }
    tracing::debug!("Transport writer exiting");
}
