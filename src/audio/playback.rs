//! Speech playback via `rodio`.
//!
//! The TTS client never touches an audio device directly.  It acquires a
//! [`Player`] from an [`AudioOutput`] on connect and drops it on disconnect;
//! the player decodes one vendor chunk at a time and plays it to completion
//! or until its stop token fires.
//!
//! Interruption applies an exponential gain ramp down to [`FADE_FLOOR`]
//! before stopping, so cutting a chunk mid-word does not click.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Gain the fade-out ramps down to before playback stops.
pub const FADE_FLOOR: f32 = 0.01;

/// Granularity of the fade ramp.
const FADE_STEP: Duration = Duration::from_millis(5);

/// How often a playing sink is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    /// No output device, or the platform refused to open it.
    #[error("audio output unavailable: {0}")]
    DeviceUnavailable(String),

    /// The chunk is not in a format the decoder understands.
    #[error("failed to decode audio chunk: {0}")]
    Decode(String),

    #[error("audio playback failed: {0}")]
    Playback(String),
}

// ---------------------------------------------------------------------------
// DecodedAudio / PlayOutcome
// ---------------------------------------------------------------------------

/// Interleaved `f32` samples ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Playback length of the decoded chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as f64 / self.channels as f64;
        Duration::from_secs_f64(frames / self.sample_rate as f64)
    }
}

/// How a [`Player::play`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The whole chunk was played.
    Finished,
    /// The stop token fired; output was faded and stopped.
    Interrupted,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Platform decode + playback primitive for one output device.
#[async_trait]
pub trait Player: Send + Sync {
    /// Decode one opaque vendor chunk (mp3/wav/…).
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError>;

    /// Play `audio` to completion, or until `stop` fires, in which case the
    /// gain is ramped down over `fade` and output stops.
    async fn play(
        &self,
        audio: DecodedAudio,
        stop: CancellationToken,
        fade: Duration,
    ) -> Result<PlayOutcome, PlaybackError>;
}

/// Factory for [`Player`]s; dropping the last handle releases the device.
pub trait AudioOutput: Send + Sync {
    fn open(&self) -> Result<Arc<dyn Player>, PlaybackError>;
}

// ---------------------------------------------------------------------------
// Fade curve
// ---------------------------------------------------------------------------

/// Gain multiplier for `step` of `steps` on an exponential ramp from 1.0 to
/// [`FADE_FLOOR`].  `step == 0` is 1.0 and `step == steps` is the floor.
pub fn fade_gain(step: u32, steps: u32) -> f32 {
    if steps == 0 {
        return FADE_FLOOR;
    }
    let t = step.min(steps) as f32 / steps as f32;
    FADE_FLOOR.powf(t)
}

/// Number of ramp steps used for a fade of length `fade`.
pub fn fade_steps(fade: Duration) -> u32 {
    let steps = fade.as_millis() / FADE_STEP.as_millis();
    steps.max(1) as u32
}

// ---------------------------------------------------------------------------
// RodioOutput / RodioPlayer
// ---------------------------------------------------------------------------

/// Default output device through `rodio`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RodioOutput;

impl AudioOutput for RodioOutput {
    fn open(&self) -> Result<Arc<dyn Player>, PlaybackError> {
        Ok(Arc::new(RodioPlayer::open_default()?))
    }
}

/// Keeps the non-`Send` `OutputStream` alive on its own thread.
struct OutputThreadGuard {
    stop_tx: std_mpsc::Sender<()>,
}

impl Drop for OutputThreadGuard {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// A [`Player`] on the default output device.
pub struct RodioPlayer {
    handle: OutputStreamHandle,
    _guard: OutputThreadGuard,
}

impl RodioPlayer {
    /// Open the default output device.
    pub fn open_default() -> Result<Self, PlaybackError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    let _ = stop_rx.recv();
                    drop(stream);
                    log::debug!("playback: output device released");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(PlaybackError::DeviceUnavailable(e.to_string())));
                }
            })
            .map_err(|e| PlaybackError::DeviceUnavailable(e.to_string()))?;

        let handle = ready_rx.recv().map_err(|_| {
            PlaybackError::DeviceUnavailable("output thread exited before reporting".into())
        })??;

        log::info!("playback: output device open");
        Ok(Self {
            handle,
            _guard: OutputThreadGuard { stop_tx },
        })
    }

    async fn fade_out(sink: &Sink, fade: Duration) {
        let steps = fade_steps(fade);
        let step_len = fade / steps;
        let start = sink.volume();
        for step in 1..=steps {
            sink.set_volume(start * fade_gain(step, steps));
            tokio::time::sleep(step_len).await;
        }
    }
}

#[async_trait]
impl Player for RodioPlayer {
    fn decode(&self, bytes: &[u8]) -> Result<DecodedAudio, PlaybackError> {
        let decoder = Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| PlaybackError::Decode(e.to_string()))?;
        let sample_rate = decoder.sample_rate();
        let channels = decoder.channels();
        let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();
        Ok(DecodedAudio {
            samples,
            sample_rate,
            channels,
        })
    }

    async fn play(
        &self,
        audio: DecodedAudio,
        stop: CancellationToken,
        fade: Duration,
    ) -> Result<PlayOutcome, PlaybackError> {
        if audio.samples.is_empty() {
            return Ok(PlayOutcome::Finished);
        }

        let sink =
            Sink::try_new(&self.handle).map_err(|e| PlaybackError::Playback(e.to_string()))?;
        sink.append(SamplesBuffer::new(
            audio.channels,
            audio.sample_rate,
            audio.samples,
        ));

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    Self::fade_out(&sink, fade).await;
                    sink.stop();
                    return Ok(PlayOutcome::Interrupted);
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if sink.empty() {
                        return Ok(PlayOutcome::Finished);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
