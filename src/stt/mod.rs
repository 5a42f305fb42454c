//! Streaming speech-to-text.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                 SpeechToTextClient                     │
//! │                                                       │
//! │   Microphone ──frames──▶ ┌──────────────┐  PCM16      │
//! │                          │ session task │──────▶ wss  │
//! │   SttEvent ◀──parse───── │  + Backoff   │◀────── json │
//! │                          └──────────────┘             │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_streaming::audio::CpalMicrophone;
//! use voice_streaming::config::AppConfig;
//! use voice_streaming::stt::{SpeechToTextClient, SttEvent};
//! use voice_streaming::transport::{ReconnectPolicy, TungsteniteConnector};
//!
//! # async fn example() -> Result<(), voice_streaming::stt::SttError> {
//! let config = AppConfig::default();
//! let (mut stt, mut events) = SpeechToTextClient::new(
//!     config.stt.clone(),
//!     ReconnectPolicy::from_config(&config.reconnect),
//!     Arc::new(TungsteniteConnector::new()),
//!     Arc::new(CpalMicrophone::default()),
//! );
//! stt.connect().await?;
//! stt.start_streaming().await?;
//! while let Some(event) = events.recv().await {
//!     if let SttEvent::Final(t) = event {
//!         println!("{}", t.text);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod messages;

use thiserror::Error;

use crate::audio::CaptureError;
use crate::transport::{ConnectionState, TransportError};

pub use client::SpeechToTextClient;
pub use messages::{listen_url, FinalTranscript, InterimTranscript, ServerMessage, Word};

// ---------------------------------------------------------------------------
// SttError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SttError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// `start_streaming` called without an open connection.
    #[error("not connected to the transcription service")]
    NotConnected,

    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// The service reported an error frame.
    #[error("transcription service error: {0}")]
    Server(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl SttError {
    /// Errors after which the subsystem cannot recover on its own.
    pub fn is_terminal(&self) -> bool {
        match self {
            SttError::Transport(e) => e.is_terminal(),
            SttError::Capture(CaptureError::DeviceUnavailable(_)) => true,
            SttError::ReconnectExhausted { .. } => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// SttEvent / SttStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// Initial connection or a successful reconnect.
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, max_attempts: u32 },
    StreamingStarted,
    StreamingStopped,
    Interim(InterimTranscript),
    Final(FinalTranscript),
    SpeechStarted,
    UtteranceEnd,
    Metadata(serde_json::Value),
    Error { error: SttError, terminal: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SttStatus {
    pub state: ConnectionState,
    pub streaming: bool,
    pub model: String,
    pub language: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(SttError::Transport(TransportError::Auth("x".into())).is_terminal());
        assert!(!SttError::Transport(TransportError::Connection("x".into())).is_terminal());
        assert!(SttError::ReconnectExhausted { attempts: 5 }.is_terminal());
        assert!(!SttError::NotConnected.is_terminal());
        assert!(!SttError::Server("bad".into()).is_terminal());
    }
}
