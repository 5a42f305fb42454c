//! Audio I/O: microphone capture, format conversion and speech playback.
//!
//! # Pipeline
//!
//! ```text
//! Microphone → cpal callback → AudioFrame (mpsc) ─┬─▶ VAD level meter
//!                                                 └─▶ stereo_to_mono → resample_linear
//!                                                       → pcm16_le_bytes → STT socket
//!
//! TTS socket → chunk bytes → Player::decode → Player::play (fade on interrupt)
//! ```
//!
//! Device handles are scoped: [`Microphone::open`] and [`AudioOutput::open`]
//! acquire, dropping the returned handle releases.

pub mod capture;
pub mod playback;
pub mod resample;
pub mod virtual_io;

pub use capture::{AudioFrame, CaptureError, CpalMicrophone, Microphone, MicrophoneStream};
pub use playback::{
    fade_gain, fade_steps, AudioOutput, DecodedAudio, PlayOutcome, PlaybackError, Player,
    RodioOutput, RodioPlayer, FADE_FLOOR,
};
pub use resample::{f32_to_i16, pcm16_le_bytes, resample_linear, stereo_to_mono};
pub use virtual_io::{ChannelMicrophone, MicrophoneFeed, PlayRecord, RecordingOutput};
