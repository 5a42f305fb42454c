//! Rolling latency averages.

use std::collections::VecDeque;
use std::time::Duration;

/// Samples kept per category.
pub const WINDOW: usize = 20;

/// The most recent [`WINDOW`] samples of one latency category.
#[derive(Debug, Clone, Default)]
pub struct RollingWindow {
    samples: VecDeque<Duration>,
}

impl RollingWindow {
    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean in whole milliseconds, `0` when empty.
    pub fn average_ms(&self) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let n = self.samples.len() as u128;
        let total_us: u128 = self.samples.iter().map(Duration::as_micros).sum();
        ((total_us + n * 500) / (n * 1_000)) as u64
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

/// Rolling windows for every category the orchestrator measures.
#[derive(Debug, Clone, Default)]
pub struct LatencyMetrics {
    /// End of user speech (VAD) to final transcript.
    pub stt: RollingWindow,
    /// Dispatch to end of the LLM stream.
    pub llm: RollingWindow,
    /// First sentence sent to first synthesised chunk.
    pub tts: RollingWindow,
    /// Final transcript to end of the LLM stream.
    pub total: RollingWindow,
}

impl LatencyMetrics {
    pub fn snapshot(&self, conversation_length: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            average_stt_ms: self.stt.average_ms(),
            average_llm_ms: self.llm.average_ms(),
            average_tts_ms: self.tts.average_ms(),
            average_total_ms: self.total.average_ms(),
            conversation_length,
        }
    }

    pub fn clear(&mut self) {
        self.stt.clear();
        self.llm.clear();
        self.tts.clear();
        self.total.clear();
    }
}

/// Rolling averages, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub average_stt_ms: u64,
    pub average_llm_ms: u64,
    pub average_tts_ms: u64,
    pub average_total_ms: u64,
    pub conversation_length: usize,
}

/// Measurements of one completed turn plus the averages after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnMetrics {
    pub turn: u64,
    /// Unknown when no VAD speech end preceded the transcript.
    pub stt: Option<Duration>,
    pub llm: Duration,
    /// Unknown when no audio had arrived by the end of the LLM stream.
    pub tts: Option<Duration>,
    pub total: Duration,
    pub averages: MetricsSnapshot,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
