//! Wire format of the streaming transcription service (Deepgram `listen`).
//!
//! Outbound: binary 16-bit LE mono PCM frames, plus a `CloseStream` JSON
//! frame at end of stream.  Inbound: JSON text frames discriminated by
//! their `type` field.

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use crate::config::SttConfig;

/// Build the `listen` URL with the streaming options as query parameters.
pub fn listen_url(config: &SttConfig) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&config.endpoint)?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("smart_format", bool_str(config.smart_format))
        .append_pair("interim_results", bool_str(config.interim_results))
        .append_pair("punctuate", bool_str(config.punctuate))
        .append_pair("endpointing", &config.endpointing_ms.to_string())
        .append_pair("vad_events", bool_str(config.vad_events))
        .append_pair("utterance_end_ms", &config.utterance_end_ms.to_string())
        .append_pair("encoding", "linear16")
        .append_pair("sample_rate", &config.sample_rate.to_string())
        .append_pair("channels", "1");
    Ok(url)
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// End-of-stream marker.
pub fn close_stream_message() -> String {
    serde_json::json!({ "type": "CloseStream" }).to_string()
}

// ---------------------------------------------------------------------------
// Transcripts
// ---------------------------------------------------------------------------

/// Per-word timing, seconds from stream start.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Word {
    pub word: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterimTranscript {
    pub text: String,
    pub confidence: f64,
}

/// A finished utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalTranscript {
    pub text: String,
    pub confidence: f64,
    pub words: Vec<Word>,
    /// The service saw trailing silence (endpointing), not just a
    /// segment boundary.
    pub speech_final: bool,
    pub received_at: Instant,
}

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Interim(InterimTranscript),
    Final(FinalTranscript),
    SpeechStarted,
    UtteranceEnd,
    Metadata(Value),
    Error(String),
    /// A `Results` frame with an empty transcript, or an unknown type.
    Ignored,
}

#[derive(Deserialize)]
struct ResultsFrame {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
    channel: ResultsChannel,
}

#[derive(Deserialize)]
struct ResultsChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    words: Vec<Word>,
}

impl ServerMessage {
    /// Parse a text frame.  `Err` only for frames that are not JSON at all.
    pub fn parse(text: &str, now: Instant) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

        Ok(match kind {
            "Results" => {
                let frame: ResultsFrame = serde_json::from_value(value)?;
                match frame.channel.alternatives.into_iter().next() {
                    Some(alt) if !alt.transcript.is_empty() => {
                        if frame.is_final {
                            ServerMessage::Final(FinalTranscript {
                                text: alt.transcript,
                                confidence: alt.confidence,
                                words: alt.words,
                                speech_final: frame.speech_final,
                                received_at: now,
                            })
                        } else {
                            ServerMessage::Interim(InterimTranscript {
                                text: alt.transcript,
                                confidence: alt.confidence,
                            })
                        }
                    }
                    _ => ServerMessage::Ignored,
                }
            }
            "SpeechStarted" => ServerMessage::SpeechStarted,
            "UtteranceEnd" => ServerMessage::UtteranceEnd,
            "Metadata" => ServerMessage::Metadata(value),
            "error" | "Error" => {
                let detail = ["description", "message", "err_msg"]
                    .iter()
                    .find_map(|k| value.get(*k).and_then(Value::as_str))
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                ServerMessage::Error(detail)
            }
            _ => ServerMessage::Ignored,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
