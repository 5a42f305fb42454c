//! Microphone capture via `cpal`.
//!
//! [`Microphone`] is the seam the VAD and STT clients acquire audio through;
//! each call to [`Microphone::open`] acquires the device and returns a
//! [`MicrophoneStream`] whose guard releases it again on drop.
//!
//! `cpal::Stream` is not `Send` on every platform, so [`CpalMicrophone`]
//! builds and owns the stream on a dedicated `audio-capture` thread.  The
//! callback forwards [`AudioFrame`]s over an unbounded tokio channel, which
//! is the only thing that crosses into async code.

use std::sync::mpsc as std_mpsc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// AudioFrame
// ---------------------------------------------------------------------------

/// A single buffer of raw audio as delivered by the capture callback.
///
/// Samples are interleaved `f32` in the range `[-1.0, 1.0]`.
/// Use [`crate::audio::stereo_to_mono`] to downmix channels and
/// [`crate::audio::resample_linear`] to convert to the service rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved PCM samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Sample rate of this frame in Hz (e.g. 44100, 48000, 16000).
    pub sample_rate: u32,
    /// Number of interleaved channels (1 = mono, 2 = stereo, …).
    pub channels: u16,
}

impl AudioFrame {
    /// Downmixed mono copy of this frame.
    pub fn to_mono(&self) -> Vec<f32> {
        crate::audio::stereo_to_mono(&self.samples, self.channels)
    }
}

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors that can occur while acquiring or running the audio capture.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    /// No input device, or the platform denied access to it.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The device exists but the stream could not be built or started.
    #[error("audio input stream failed: {0}")]
    Stream(String),
}

impl CaptureError {
    /// Access problems need the user to act; stream hiccups do not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureError::DeviceUnavailable(_))
    }
}

impl From<cpal::DefaultStreamConfigError> for CaptureError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        CaptureError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                CaptureError::DeviceUnavailable(e.to_string())
            }
            other => CaptureError::Stream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(e: cpal::PlayStreamError) -> Self {
        CaptureError::Stream(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Microphone / MicrophoneStream
// ---------------------------------------------------------------------------

/// Anything that can hand out live microphone audio.
///
/// `open` may block briefly while the platform opens the device; async
/// callers run it on the blocking pool.
pub trait Microphone: Send + Sync {
    fn open(&self) -> Result<MicrophoneStream, CaptureError>;
}

/// Live capture handle.  Dropping it releases the device.
pub struct MicrophoneStream {
    /// Frames in capture order.
    pub frames: mpsc::UnboundedReceiver<AudioFrame>,
    /// Native sample rate of the device.
    pub sample_rate: u32,
    /// Native channel count of the device.
    pub channels: u16,
    _guard: Box<dyn Send>,
}

impl MicrophoneStream {
    /// Wrap a frame receiver together with whatever keeps the device alive.
    pub fn new(
        frames: mpsc::UnboundedReceiver<AudioFrame>,
        sample_rate: u32,
        channels: u16,
        guard: impl Send + 'static,
    ) -> Self {
        Self {
            frames,
            sample_rate,
            channels,
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for MicrophoneStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrophoneStream")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// CpalMicrophone
// ---------------------------------------------------------------------------

/// Stops the capture thread (and with it the cpal stream) when dropped.
struct CaptureThreadGuard {
    stop_tx: std_mpsc::Sender<()>,
}

impl Drop for CaptureThreadGuard {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

/// Microphone backed by the default `cpal` host.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    /// Input device name: `None` means the system default.
    device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn find_device(name: Option<&str>) -> Result<cpal::Device, CaptureError> {
        let host = cpal::default_host();
        match name {
            None => host.default_input_device().ok_or_else(|| {
                CaptureError::DeviceUnavailable("no default input device".into())
            }),
            Some(wanted) => host
                .input_devices()
                .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| {
                    CaptureError::DeviceUnavailable(format!("input device {wanted:?} not found"))
                }),
        }
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self) -> Result<MicrophoneStream, CaptureError> {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<AudioFrame>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(u32, u16), CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let device_name = self.device_name.clone();

        thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let started = (|| {
                    let device = Self::find_device(device_name.as_deref())?;
                    let supported = device.default_input_config()?;
                    let channels = supported.channels();
                    let sample_rate = supported.sample_rate().0;
                    let config: cpal::StreamConfig = supported.into();

                    let stream = device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            // Receiver gone means the owner is shutting down.
                            let _ = frame_tx.send(AudioFrame {
                                samples: data.to_vec(),
                                sample_rate,
                                channels,
                            });
                        },
                        |err: cpal::StreamError| {
                            log::error!("capture: cpal stream error: {err}");
                        },
                        None,
                    )?;
                    stream.play()?;
                    Ok::<_, CaptureError>((stream, sample_rate, channels))
                })();

                match started {
                    Ok((stream, sample_rate, channels)) => {
                        let _ = ready_tx.send(Ok((sample_rate, channels)));
                        // Park until the guard is dropped.
                        let _ = stop_rx.recv();
                        drop(stream);
                        log::debug!("capture: device released");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn capture thread: {e}")))?;

        let (sample_rate, channels) = ready_rx.recv().map_err(|_| {
            CaptureError::Stream("capture thread exited before reporting".into())
        })??;

        log::info!("capture: microphone open ({sample_rate} Hz, {channels} ch)");
        Ok(MicrophoneStream::new(
            frame_rx,
            sample_rate,
            channels,
            CaptureThreadGuard { stop_tx },
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_frame_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AudioFrame>();
        assert_send::<MicrophoneStream>();
    }

    #[test]
    fn frame_to_mono_averages_channels() {
        let frame = AudioFrame {
            samples: vec![1.0, 0.0, 0.5, 0.5],
            sample_rate: 48_000,
            channels: 2,
        };
        assert_eq!(frame.to_mono(), vec![0.5, 0.5]);
    }

    #[test]
    fn dropping_stream_runs_guard() {
        let (tx, rx) = std_mpsc::channel::<()>();
        let (_frame_tx, frame_rx) = mpsc::unbounded_channel();
        let stream = MicrophoneStream::new(frame_rx, 16_000, 1, CaptureThreadGuard { stop_tx: tx });
        drop(stream);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn device_not_available_maps_to_device_unavailable() {
        let err: CaptureError = cpal::BuildStreamError::DeviceNotAvailable.into();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)));
    }
}
