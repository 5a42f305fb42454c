//! Device-free implementations of [`Microphone`] and [`AudioOutput`].
//!
//! [`ChannelMicrophone`] plays back whatever is pushed through its
//! [`MicrophoneFeed`]; [`RecordingOutput`] "plays" chunks by sleeping for
//! their duration on the tokio clock and records what happened.  Both are
//! used by the test suites and by headless runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::capture::{AudioFrame, CaptureError, Microphone, MicrophoneStream};
use super::playback::{AudioOutput, DecodedAudio, PlayOutcome, PlaybackError, Player};

// ---------------------------------------------------------------------------
// ChannelMicrophone
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MicShared {
    streams: Vec<mpsc::UnboundedSender<AudioFrame>>,
    failures: VecDeque<CaptureError>,
    opened: u32,
}

/// A microphone fed from code.
#[derive(Clone)]
pub struct ChannelMicrophone {
    sample_rate: u32,
    channels: u16,
    shared: Arc<Mutex<MicShared>>,
}

/// Pushes audio into every open [`ChannelMicrophone`] stream.
#[derive(Clone)]
pub struct MicrophoneFeed {
    sample_rate: u32,
    channels: u16,
    shared: Arc<Mutex<MicShared>>,
}

impl ChannelMicrophone {
    pub fn new(sample_rate: u32, channels: u16) -> (Self, MicrophoneFeed) {
        let shared = Arc::new(Mutex::new(MicShared::default()));
        (
            Self {
                sample_rate,
                channels,
                shared: shared.clone(),
            },
            MicrophoneFeed {
                sample_rate,
                channels,
                shared,
            },
        )
    }

    /// Make the next `open` fail with `err`.
    pub fn fail_next(&self, err: CaptureError) {
        self.shared.lock().unwrap().failures.push_back(err);
    }

    /// Successful `open` calls so far.
    pub fn opened(&self) -> u32 {
        self.shared.lock().unwrap().opened
    }
}

impl Microphone for ChannelMicrophone {
    fn open(&self) -> Result<MicrophoneStream, CaptureError> {
        let mut shared = self.shared.lock().unwrap();
        if let Some(err) = shared.failures.pop_front() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        shared.streams.push(tx);
        shared.opened += 1;
        Ok(MicrophoneStream::new(rx, self.sample_rate, self.channels, ()))
    }
}

impl MicrophoneFeed {
    /// Deliver `samples` to every open stream.  Returns how many received it.
    pub fn push(&self, samples: &[f32]) -> usize {
        let mut shared = self.shared.lock().unwrap();
        let frame = AudioFrame {
            samples: samples.to_vec(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        };
        shared.streams.retain(|tx| tx.send(frame.clone()).is_ok());
        shared.streams.len()
    }

    /// Deliver a constant-level frame of `len` samples.
    pub fn push_level(&self, level: f32, len: usize) -> usize {
        self.push(&vec![level; len])
    }

    /// Number of streams still open.
    pub fn listeners(&self) -> usize {
        let mut shared = self.shared.lock().unwrap();
        shared.streams.retain(|tx| !tx.is_closed());
        shared.streams.len()
    }
}

// ---------------------------------------------------------------------------
// RecordingOutput
// ---------------------------------------------------------------------------

/// One call to [`Player::play`] as seen by [`RecordingOutput`].
#[derive(Debug, Clone, PartialEq)]
pub struct PlayRecord {
    /// The original chunk bytes.
    pub payload: Vec<u8>,
    pub started: Instant,
    pub ended: Instant,
    pub outcome: PlayOutcome,
}

#[derive(Default)]
struct OutShared {
    records: Vec<PlayRecord>,
    active: u32,
    max_active: u32,
    opened: u32,
    open_handles: u32,
}

/// An output whose player sleeps one millisecond per byte.
///
/// Empty chunks fail to decode.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    shared: Arc<Mutex<OutShared>>,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PlayRecord> {
        self.shared.lock().unwrap().records.clone()
    }

    /// Highest number of chunks ever playing at the same time.
    pub fn max_concurrent(&self) -> u32 {
        self.shared.lock().unwrap().max_active
    }

    /// Number of players handed out.
    pub fn opened(&self) -> u32 {
        self.shared.lock().unwrap().opened
    }

    /// Players currently alive.
    pub fn open_handles(&self) -> u32 {
        self.shared.lock().unwrap().open_handles
    }
}

impl AudioOutput for RecordingOutput {
    fn open(&self) -> Result<Arc<dyn Player>, PlaybackError> {
        let mut shared = self.shared.lock().unwrap();
        shared.opened += 1;
        shared.open_handles += 1;
        Ok(Arc::new(RecordingPlayer {
            shared: self.shared.clone(),
        }))
    }
}

struct RecordingPlayer {
    shared: Arc<Mutex<OutShared>>,
}

impl Drop for RecordingPlayer {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.open_handles = shared.open_handles.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Player for RecordingPlayer {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
        if bytes.is_empty() {
            return Err(PlaybackError::Decode("empty chunk".into()));
        }
        Ok(DecodedAudio {
            samples: bytes.iter().map(|&b| b as f32).collect(),
            sample_rate: 1_000,
            channels: 1,
        })
    }

    async fn play(
        &self,
        audio: DecodedAudio,
        stop: CancellationToken,
        fade: Duration,
    ) -> Result<PlayOutcome, PlaybackError> {
        let started = Instant::now();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.active += 1;
            shared.max_active = shared.max_active.max(shared.active);
        }

        let outcome = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tokio::time::sleep(fade).await;
                PlayOutcome::Interrupted
            }
            _ = tokio::time::sleep(audio.duration()) => PlayOutcome::Finished,
        };

        let mut shared = self.shared.lock().unwrap();
        shared.active -= 1;
        shared.records.push(PlayRecord {
            payload: audio.samples.iter().map(|&s| s as u8).collect(),
            started,
            ended: Instant::now(),
            outcome,
        });
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
