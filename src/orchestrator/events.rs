//! Session-level notifications for front ends.

use std::fmt;
use std::time::SystemTime;

use crate::config::VoiceProfile;

use super::metrics::TurnMetrics;
use super::state::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Assistant,
}

/// One utterance in the session's conversation buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: SystemTime,
    /// Transcription confidence; user entries only.
    pub confidence: Option<f64>,
}

impl ConversationEntry {
    pub fn user(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
            timestamp: SystemTime::now(),
            confidence: Some(confidence),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Assistant,
            text: text.into(),
            timestamp: SystemTime::now(),
            confidence: None,
        }
    }
}

/// Which part of the pipeline an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Vad,
    Stt,
    Llm,
    Tts,
    Session,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subsystem::Vad => "vad",
            Subsystem::Stt => "stt",
            Subsystem::Llm => "llm",
            Subsystem::Tts => "tts",
            Subsystem::Session => "session",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub subsystem: Subsystem,
    pub message: String,
    /// The session was stopped because of this error.
    pub terminal: bool,
}

/// Everything the orchestrator reports.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Initialized { voice: VoiceProfile, init_ms: u64 },
    Started,
    Stopped,
    CleanedUp,
    /// Smoothed microphone level.
    Volume(f32),
    UserSpeechStart,
    UserSpeechEnd,
    InterimTranscript(String),
    UserMessage(String),
    AiSentence(String),
    AiMessageComplete(String),
    AiAudioChunk { len: usize },
    AiSpeechStart,
    AiSpeechEnd,
    /// The user barged in; generation and playback were cut.
    Interrupted,
    /// The synthesis client confirmed its interrupt.
    AiInterrupted,
    VoiceChanged(VoiceProfile),
    Metrics(TurnMetrics),
    Error(ErrorReport),
}
