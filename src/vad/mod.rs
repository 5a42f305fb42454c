//! Voice-activity detection.
//!
//! * [`VoiceActivityDetector`]: owns the capture device and the sampling
//!   loop, publishes [`VadEvent`]s.
//! * [`VadStateMachine`]: the debounced Silent / Speaking classifier.
//! * [`PreSpeechBuffer`]: lookback attached to every speech start.

pub mod detector;
pub mod state;

use tokio::time::Instant;

use crate::audio::CaptureError;

pub use detector::VoiceActivityDetector;
pub use state::{
    rms, PreSpeechBuffer, VadPhase, VadStateMachine, VadTransition, VolumeSample, VolumeSmoother,
};

/// Everything the detector reports.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    Initialized,
    Started,
    Stopped,
    CleanedUp,
    /// Smoothed level, once per tick.
    Volume(f32),
    /// Speech held for `min_speech_ms`.  `pre_speech` is the lookback
    /// window ending at `at`.
    SpeechStart {
        at: Instant,
        pre_speech: Vec<VolumeSample>,
    },
    /// Silence held for `max_silence_ms`.
    SpeechEnd { at: Instant },
    Error(CaptureError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadStatus {
    pub initialized: bool,
    pub listening: bool,
    pub speaking: bool,
    pub volume: f32,
}

/// Result of [`VoiceActivityDetector::test_microphone`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicrophoneCheck {
    /// `true` when any signal at all was measured.
    pub working: bool,
    pub volume: f32,
    pub threshold: f32,
}

impl MicrophoneCheck {
    pub fn new(volume: f32, threshold: f32) -> Self {
        Self {
            working: volume > 0.0,
            volume,
            threshold,
        }
    }
}
