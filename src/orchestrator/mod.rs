//! Session orchestration: turn-taking, barge-in and latency metrics.
//!
//! # Architecture
//!
//! ```text
//!   VAD ──speech start/end, volume──┐
//!   STT ──interim / final──────────┤            ┌──▶ LLM.spawn_response
//!   LLM ──sentence / complete──────┼─▶ Orchestrator ──▶ TTS.stream_text
//!   TTS ──playback start/finish────┘      │      └──▶ LLM.cancel + TTS.interrupt  (barge-in)
//!                                         ▼
//!                                    SessionEvent ──▶ front end
//! ```
//!
//! [`Orchestrator`] owns one client per subsystem and is driven either
//! directly ([`Orchestrator::recv_incoming`] / [`Orchestrator::handle`]) or
//! through [`spawn`], which runs it on a task behind a cloneable
//! [`SessionHandle`].

pub mod events;
pub mod metrics;
pub mod runner;
pub mod session;
pub mod state;

use thiserror::Error;

use crate::audio::CaptureError;
use crate::llm::LlmError;
use crate::stt::SttError;
use crate::tts::TtsError;

pub use events::{ConversationEntry, ErrorReport, SessionEvent, Speaker, Subsystem};
pub use metrics::{LatencyMetrics, MetricsSnapshot, RollingWindow, TurnMetrics};
pub use runner::{spawn, Command, SessionHandle};
pub use session::{Incoming, Orchestrator, Platform, SessionStatus};
pub use state::SessionState;

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    /// The requested voice is not in the `voices` table.
    #[error("unknown voice: {0}")]
    UnknownVoice(String),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error(transparent)]
    Vad(#[from] CaptureError),

    #[error(transparent)]
    Stt(#[from] SttError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tts(#[from] TtsError),

    /// The session task is gone.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn is_terminal(&self) -> bool {
        match self {
            SessionError::Vad(e) => e.is_terminal(),
            SessionError::Stt(e) => e.is_terminal(),
            SessionError::Llm(e) => e.is_terminal(),
            SessionError::Tts(e) => e.is_terminal(),
            SessionError::Closed => true,
            SessionError::UnknownVoice(_) | SessionError::InvalidState { .. } => false,
        }
    }

    pub fn subsystem(&self) -> Subsystem {
        match self {
            SessionError::Vad(_) => Subsystem::Vad,
            SessionError::Stt(_) => Subsystem::Stt,
            SessionError::Llm(_) => Subsystem::Llm,
            SessionError::Tts(_) => Subsystem::Tts,
            _ => Subsystem::Session,
        }
    }
}
