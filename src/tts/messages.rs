//! Wire format of the streaming synthesis service (MiniMax `t2a_v2`).
//!
//! Outbound: one `auth` frame right after the handshake, then `tts`
//! requests and periodic `ping`s.  Inbound: raw binary audio or JSON frames
//! discriminated by `type`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use url::Url;

use crate::config::TtsConfig;

/// Connection URL carrying the voice and account group.
pub fn tts_url(config: &TtsConfig, voice_id: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&config.endpoint)?;
    url.query_pairs_mut()
        .append_pair("voice_id", voice_id)
        .append_pair("group_id", config.group_id.as_deref().unwrap_or(""));
    Ok(url)
}

pub fn auth_message(config: &TtsConfig, voice_id: &str) -> Value {
    json!({
        "type":     "auth",
        "api_key":  config.api_key.as_deref().unwrap_or(""),
        "group_id": config.group_id.as_deref().unwrap_or(""),
        "model":    config.model,
        "voice_id": voice_id,
    })
}

/// One sentence to synthesise.
pub fn synthesis_request(config: &TtsConfig, request_id: u64, text: &str) -> Value {
    json!({
        "type":           "tts",
        "request_id":     request_id,
        "text":           text,
        "model":          config.model,
        "voice_settings": config.voice_settings,
        "streaming":      true,
        "format":         config.format,
        "sample_rate":    config.sample_rate,
        "speed":          config.speed,
    })
}

pub fn ping_message() -> Value {
    json!({ "type": "ping" })
}

// ---------------------------------------------------------------------------
// ServerMessage
// ---------------------------------------------------------------------------

/// One parsed inbound JSON frame.  `request_id` is present only when the
/// service echoes it back.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    AuthSuccess { session_id: Option<String> },
    AudioStart { request_id: Option<u64> },
    AudioChunk { request_id: Option<u64>, audio: Vec<u8> },
    AudioEnd { request_id: Option<u64> },
    Transcript(String),
    Error(String),
    Pong,
    Unknown(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base64 audio: {0}")]
    Audio(#[from] base64::DecodeError),
}

fn request_id(value: &Value) -> Option<u64> {
    value.get("request_id").and_then(Value::as_u64)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

        Ok(match kind {
            "auth_success" => ServerMessage::AuthSuccess {
                session_id: str_field(&value, "session_id"),
            },
            "audio_start" => ServerMessage::AudioStart {
                request_id: request_id(&value),
            },
            "audio_chunk" => ServerMessage::AudioChunk {
                request_id: request_id(&value),
                audio: match value.get("audio").and_then(Value::as_str) {
                    Some(encoded) => BASE64.decode(encoded)?,
                    None => Vec::new(),
                },
            },
            "audio_end" => ServerMessage::AudioEnd {
                request_id: request_id(&value),
            },
            "transcript" => ServerMessage::Transcript(str_field(&value, "text").unwrap_or_default()),
            "error" => ServerMessage::Error(error_detail(&value)),
            "pong" => ServerMessage::Pong,
            other => ServerMessage::Unknown(other.to_string()),
        })
    }
}

/// `error` may be a string or an object with a `message`.
fn error_detail(value: &Value) -> String {
    match value.get("error").or_else(|| value.get("message")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => "unspecified error".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
