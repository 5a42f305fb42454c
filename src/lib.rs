//! Full-duplex voice conversation pipeline.
//!
//! Microphone audio is gated by voice-activity detection and streamed to a
//! speech-to-text service; final transcripts go to a streaming language
//! model whose reply is relayed sentence by sentence to a text-to-speech
//! service and played back.  Speaking over the assistant interrupts it.
//!
//! * [`audio`]: capture, format conversion and playback devices.
//! * [`transport`]: websocket plumbing and reconnect policy.
//! * [`vad`]: voice-activity detector.
//! * [`stt`]: streaming transcription client.
//! * [`llm`]: streaming chat-completion client with sentence chunking.
//! * [`tts`]: streaming synthesis client and playback queue.
//! * [`orchestrator`]: the session state machine tying them together.
//! * [`config`]: `settings.toml` plus environment overrides.

pub mod audio;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod stt;
pub mod transport;
pub mod tts;
pub mod vad;
