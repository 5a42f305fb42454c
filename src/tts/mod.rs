//! Streaming text-to-speech with serialized playback and barge-in.
//!
//! # Architecture
//!
//! ```text
//! stream_text(sentence) ──tts request──▶ wss ──audio chunks──▶ PlaybackQueue
//!                                                                   │ FIFO
//!                                               playback loop ◀─────┘
//!                                     decode → play (one at a time) → speaker
//! interrupt() ──▶ cancel current chunk (fade) + clear queue + drop stale chunks
//! ```

pub mod client;
pub mod messages;
pub mod queue;

use thiserror::Error;

use crate::audio::PlaybackError;
use crate::transport::{ConnectionState, TransportError};

pub use client::TextToSpeechClient;
pub use messages::ServerMessage;
pub use queue::{AudioChunk, InterruptReport, PlaybackQueue};

// ---------------------------------------------------------------------------
// TtsError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TtsError {
    /// The service rejected a synthesis request.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// `stream_text` called without an authenticated session.
    #[error("not connected to the synthesis service")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl TtsError {
    pub fn is_terminal(&self) -> bool {
        match self {
            TtsError::Transport(e) => e.is_terminal(),
            TtsError::Playback(PlaybackError::DeviceUnavailable(_)) => true,
            TtsError::ReconnectExhausted { .. } => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// TtsEvent / TtsStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// Transport open (initial connect or reconnect).
    Connected,
    Authenticated { session_id: Option<String> },
    Disconnected,
    Reconnecting { attempt: u32, max_attempts: u32 },
    SynthesisStarted { request_id: u64 },
    AudioChunk { seq: u64, request_id: u64, len: usize },
    SynthesisEnded { request_id: u64 },
    /// First chunk of a run started playing.
    PlaybackStarted,
    /// The queue ran dry after playing, or was cleared.
    PlaybackFinished,
    Interrupted,
    Transcript(String),
    Error { error: TtsError, terminal: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TtsStatus {
    pub state: ConnectionState,
    pub voice_id: Option<String>,
    pub session_id: Option<String>,
    pub playing: bool,
    pub queued: usize,
}
