//! Pure voice-activity state machine and its level helpers.
//!
//! Nothing in here touches a device or a clock; every call takes the
//! current volume and timestamp explicitly, so the debounce rules can be
//! tested sample by sample.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::VadConfig;

// ---------------------------------------------------------------------------
// rms / VolumeSmoother
// ---------------------------------------------------------------------------

/// Root-mean-square magnitude of `samples`; `0.0` for an empty window.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Moving average over the last `len` RMS values.
#[derive(Debug, Clone)]
pub struct VolumeSmoother {
    history: VecDeque<f32>,
    len: usize,
}

impl VolumeSmoother {
    pub fn new(len: usize) -> Self {
        let len = len.max(1);
        Self {
            history: VecDeque::with_capacity(len),
            len,
        }
    }

    /// Push a raw value and return the smoothed level.
    pub fn push(&mut self, value: f32) -> f32 {
        self.history.push_back(value);
        while self.history.len() > self.len {
            self.history.pop_front();
        }
        self.history.iter().sum::<f32>() / self.history.len() as f32
    }

    pub fn resize(&mut self, len: usize) {
        self.len = len.max(1);
        while self.history.len() > self.len {
            self.history.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

// ---------------------------------------------------------------------------
// PreSpeechBuffer
// ---------------------------------------------------------------------------

/// One smoothed level reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeSample {
    pub volume: f32,
    pub at: Instant,
}

/// Time-bounded lookback of recent volume samples.
#[derive(Debug, Clone)]
pub struct PreSpeechBuffer {
    samples: VecDeque<VolumeSample>,
    window: Duration,
}

impl PreSpeechBuffer {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record a sample and drop everything older than the window.
    /// A zero window keeps nothing.
    pub fn push(&mut self, sample: VolumeSample) {
        if self.window.is_zero() {
            return;
        }
        let now = sample.at;
        self.samples.push_back(sample);
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<VolumeSample> {
        self.samples.iter().copied().collect()
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
        if window.is_zero() {
            self.samples.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// VadPhase / VadStateMachine
// ---------------------------------------------------------------------------

/// Debounced speaking/silent classification.
///
/// ```text
/// Silent ──loud──▶ SpeechCandidate ──loud for min_speech──▶ Speaking
///    ▲                  │ quiet                                │ quiet
///    │                  ▼                                      ▼
///    └── quiet for max_silence ── SilenceCandidate ◀───────────┘
///                                      │ loud ──▶ Speaking
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadPhase {
    #[default]
    Silent,
    SpeechCandidate,
    Speaking,
    SilenceCandidate,
}

impl VadPhase {
    /// `true` once speech has been committed and until silence is.
    pub fn is_speaking(&self) -> bool {
        matches!(self, VadPhase::Speaking | VadPhase::SilenceCandidate)
    }
}

/// A committed change reported by [`VadStateMachine::feed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStart,
    SpeechEnd,
}

#[derive(Debug, Clone)]
pub struct VadStateMachine {
    phase: VadPhase,
    candidate_since: Option<Instant>,
    contrary_run: u32,
    threshold: f32,
    min_speech: Duration,
    max_silence: Duration,
    reversal_samples: u32,
}

impl VadStateMachine {
    pub fn new(config: &VadConfig) -> Self {
        let mut machine = Self {
            phase: VadPhase::Silent,
            candidate_since: None,
            contrary_run: 0,
            threshold: 0.0,
            min_speech: Duration::ZERO,
            max_silence: Duration::ZERO,
            reversal_samples: 1,
        };
        machine.reconfigure(config);
        machine
    }

    /// Apply new thresholds; the current phase is kept.
    pub fn reconfigure(&mut self, config: &VadConfig) {
        self.threshold = config.silence_threshold;
        self.min_speech = Duration::from_millis(config.min_speech_ms);
        self.max_silence = Duration::from_millis(config.max_silence_ms);
        self.reversal_samples = config.reversal_samples.max(1);
    }

    pub fn phase(&self) -> VadPhase {
        self.phase
    }

    pub fn is_speaking(&self) -> bool {
        self.phase.is_speaking()
    }

    pub fn reset(&mut self) {
        self.phase = VadPhase::Silent;
        self.candidate_since = None;
        self.contrary_run = 0;
    }

    /// Feed one smoothed level.  Returns a transition when one commits.
    pub fn feed(&mut self, volume: f32, now: Instant) -> Option<VadTransition> {
        let loud = volume >= self.threshold;

        match self.phase {
            VadPhase::Silent => {
                if loud {
                    self.enter_candidate(VadPhase::SpeechCandidate, now);
                    return self.try_commit(now);
                }
                None
            }
            VadPhase::SpeechCandidate => {
                if loud {
                    self.contrary_run = 0;
                    self.try_commit(now)
                } else {
                    self.contrary_run += 1;
                    if self.contrary_run >= self.reversal_samples {
                        self.phase = VadPhase::Silent;
                        self.candidate_since = None;
                        self.contrary_run = 0;
                    }
                    None
                }
            }
            VadPhase::Speaking => {
                if !loud {
                    self.enter_candidate(VadPhase::SilenceCandidate, now);
                    return self.try_commit(now);
                }
                None
            }
            VadPhase::SilenceCandidate => {
                if !loud {
                    self.contrary_run = 0;
                    self.try_commit(now)
                } else {
                    self.contrary_run += 1;
                    if self.contrary_run >= self.reversal_samples {
                        self.phase = VadPhase::Speaking;
                        self.candidate_since = None;
                        self.contrary_run = 0;
                    }
                    None
                }
            }
        }
    }

    fn enter_candidate(&mut self, phase: VadPhase, now: Instant) {
        self.phase = phase;
        self.candidate_since = Some(now);
        self.contrary_run = 0;
    }

    fn try_commit(&mut self, now: Instant) -> Option<VadTransition> {
        let since = self.candidate_since?;
        let held = now.saturating_duration_since(since);
        match self.phase {
            VadPhase::SpeechCandidate if held >= self.min_speech => {
                self.phase = VadPhase::Speaking;
                self.candidate_since = None;
                Some(VadTransition::SpeechStart)
            }
            VadPhase::SilenceCandidate if held >= self.max_silence => {
                self.phase = VadPhase::Silent;
                self.candidate_since = None;
                Some(VadTransition::SpeechEnd)
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
