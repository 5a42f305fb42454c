//! Bidirectional streaming transport shared by the STT and TTS clients.
//!
//! A [`Connector`] turns a [`ConnectRequest`] into a [`Duplex`]: a pair of
//! channels carrying [`Frame`]s to and from the remote end.  The inbound
//! receiver closing means the connection is gone; callers never see the
//! underlying socket.
//!
//! * [`TungsteniteConnector`]: real websocket via `tokio-tungstenite`.
//! * [`MemoryConnector`]: in-process peer for tests and offline runs.
//! * [`Backoff`]: bounded fixed-delay reconnection state machine.

pub mod connector;
pub mod memory;
pub mod reconnect;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use connector::TungsteniteConnector;
pub use memory::{MemoryConnector, RemotePeer};
pub use reconnect::{Backoff, ReconnectPolicy};

// ---------------------------------------------------------------------------
// TransportError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Network-level failure: DNS, TCP, TLS, handshake or a dropped socket.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The service rejected the credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),
}

impl TransportError {
    /// Auth failures are never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Auth(_))
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Lifecycle of one streaming connection.
///
/// Audio or text is only sent while `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Closing,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Closing => "closing",
        }
    }

    /// `true` once the handshake has completed and until close begins.
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Streaming)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Frame / Duplex
// ---------------------------------------------------------------------------

/// One websocket message, stripped of control frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Outbound: close the connection.  Inbound: the peer closed it.
    Close,
}

impl Frame {
    /// Serialise `value` as a JSON text frame.
    pub fn json(value: &serde_json::Value) -> Self {
        Frame::Text(value.to_string())
    }
}

/// An open connection.
#[derive(Debug)]
pub struct Duplex {
    /// Frames to the remote end.  Dropping it closes the connection.
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Frames from the remote end.  `None` from `recv` means the
    /// connection is gone.
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Duplex {
    /// Queue a frame; `false` when the connection is already gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

// ---------------------------------------------------------------------------
// ConnectRequest / Connector
// ---------------------------------------------------------------------------

/// Where to connect and which extra handshake headers to send.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// URL with any query string removed, for log lines.
    pub fn redacted_url(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

/// Opens streaming connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<Duplex, TransportError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
