//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Every struct is `#[serde(default)]`, so a partial `settings.toml` only
//! needs the keys the user wants to change.
//!
//! Secrets are never required in the file: [`AppConfig::apply_env`] reads
//! them from the process environment (optionally seeded from a `.env` file).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// VadConfig
// ---------------------------------------------------------------------------

/// Voice-activity detection thresholds and timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Smoothed RMS level (0.0 – 1.0) at or above which a tick counts as speech.
    pub silence_threshold: f32,
    /// Speech must persist this long before `speech_start` fires.
    pub min_speech_ms: u64,
    /// Silence must persist this long before `speech_end` fires.
    pub max_silence_ms: u64,
    /// Lookback window of volume samples attached to `speech_start`.
    /// `0` disables the buffer.
    pub pre_speech_buffer_ms: u64,
    /// Sampling cadence of the detection loop (~60 Hz).
    pub tick_ms: u64,
    /// Number of samples in the analysis window the RMS is computed over.
    pub analysis_window: usize,
    /// Number of RMS values averaged into the reported volume.
    pub smoothing_samples: usize,
    /// Consecutive contrary samples needed before a pending candidate is
    /// reset.  `1` resets on the first contrary sample.
    pub reversal_samples: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 0.01,
            min_speech_ms: 250,
            max_silence_ms: 800,
            pre_speech_buffer_ms: 300,
            tick_ms: 16,
            analysis_window: 2048,
            smoothing_samples: 5,
            reversal_samples: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// SttConfig
// ---------------------------------------------------------------------------

/// Settings for the streaming transcription service (Deepgram wire format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Websocket endpoint, without query string.
    pub endpoint: String,
    /// API key: usually supplied through `DEEPGRAM_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    pub language: String,
    pub smart_format: bool,
    pub interim_results: bool,
    pub punctuate: bool,
    /// Trailing silence (ms) after which the service finalises an utterance.
    pub endpointing_ms: u32,
    pub vad_events: bool,
    pub utterance_end_ms: u32,
    /// Sample rate of the PCM frames sent to the service.
    pub sample_rate: u32,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.deepgram.com/v1/listen".into(),
            api_key: None,
            model: "nova-2".into(),
            language: "en-US".into(),
            smart_format: true,
            interim_results: true,
            punctuate: true,
            endpointing_ms: 300,
            vad_events: true,
            utterance_end_ms: 1000,
            sample_rate: 16_000,
        }
    }
}

// ---------------------------------------------------------------------------
// LlmConfig
// ---------------------------------------------------------------------------

/// Settings for the streaming language-model client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (the client appends
    /// `/chat/completions`).
    pub base_url: String,
    /// API key: usually supplied through `GROQ_API_KEY`.
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    /// Number of most recent history messages sent with every request.
    pub history_window: usize,
    /// Minimum trimmed length (chars) before a sentence boundary may fire.
    pub min_sentence_chars: usize,
    /// Replaces the built-in system prompt when set.
    pub system_prompt: Option<String>,
    /// Seconds to wait for the response headers.
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.groq.com/openai/v1".into(),
            api_key: None,
            model: "llama-3.3-70b-versatile".into(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            history_window: 10,
            min_sentence_chars: 10,
            system_prompt: None,
            connect_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// TtsConfig
// ---------------------------------------------------------------------------

/// Per-request voice shaping forwarded verbatim to the synthesis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub speed: f32,
    pub vol: f32,
    pub pitch: i32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            speed: 1.0,
            vol: 1.0,
            pitch: 0,
        }
    }
}

/// Settings for the streaming synthesis service (MiniMax wire format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub endpoint: String,
    /// API key: usually supplied through `MINIMAX_API_KEY`.
    pub api_key: Option<String>,
    /// Account group: usually supplied through `MINIMAX_GROUP_ID`.
    pub group_id: Option<String>,
    pub model: String,
    pub format: String,
    pub sample_rate: u32,
    pub speed: f32,
    pub voice_settings: VoiceSettings,
    /// Keep-alive ping interval; `0` disables pings.
    pub ping_interval_ms: u64,
    /// How long `connect` waits for `auth_success`.
    pub auth_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.minimax.chat/ws/v1/t2a_v2".into(),
            api_key: None,
            group_id: None,
            model: "speech-02-turbo".into(),
            format: "mp3".into(),
            sample_rate: 32_000,
            speed: 1.0,
            voice_settings: VoiceSettings::default(),
            ping_interval_ms: 30_000,
            auth_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// InterruptionConfig
// ---------------------------------------------------------------------------

/// Barge-in behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    /// When `false`, user speech never interrupts machine speech.
    pub enabled: bool,
    /// Length of the exponential gain ramp applied to the playing chunk.
    pub fade_out_ms: u64,
    /// Drop queued-but-unplayed chunks on interrupt.
    pub clear_queue_on_interrupt: bool,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fade_out_ms: 50,
            clear_queue_on_interrupt: true,
        }
    }
}

impl InterruptionConfig {
    pub fn fade_out(&self) -> Duration {
        Duration::from_millis(self.fade_out_ms)
    }
}

// ---------------------------------------------------------------------------
// ReconnectConfig
// ---------------------------------------------------------------------------

/// Bounded retry policy shared by the STT and TTS clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            delay_ms: 1_000,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Device selection for capture and playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AudioConfig {
    /// Input device name: `None` means the system default.
    pub input_device: Option<String>,
}

// ---------------------------------------------------------------------------
// VoiceProfile
// ---------------------------------------------------------------------------

/// A selectable synthesis voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    /// Identifier sent to the synthesis service.
    pub id: String,
    /// Human-readable name shown by the front end.
    pub label: String,
}

fn default_voices() -> BTreeMap<String, VoiceProfile> {
    let mut voices = BTreeMap::new();
    voices.insert(
        "austyn".to_string(),
        VoiceProfile {
            id: "English_Trustworth_Man".into(),
            label: "Austyn".into(),
        },
    );
    voices.insert(
        "ada".to_string(),
        VoiceProfile {
            id: "English_Graceful_Lady".into(),
            label: "Ada".into(),
        },
    );
    voices
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_streaming::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Voice selected when the front end does not name one.
    pub default_voice: String,
    pub vad: VadConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub interruption: InterruptionConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
    /// Selectable voices keyed by the name the front end uses.
    pub voices: BTreeMap<String, VoiceProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_voice: "austyn".into(),
            vad: VadConfig::default(),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            interruption: InterruptionConfig::default(),
            reconnect: ReconnectConfig::default(),
            audio: AudioConfig::default(),
            voices: default_voices(),
        }
    }
}

/// Environment variables that override secrets in the TOML file.
pub const ENV_DEEPGRAM_KEY: &str = "DEEPGRAM_API_KEY";
pub const ENV_GROQ_KEY: &str = "GROQ_API_KEY";
pub const ENV_MINIMAX_KEY: &str = "MINIMAX_API_KEY";
pub const ENV_MINIMAX_GROUP: &str = "MINIMAX_GROUP_ID";

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet
    /// (first-run scenario) so callers never need to special-case a missing
    /// file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay API keys from the process environment.
    ///
    /// Call [`load_dotenv`] first to seed the environment from a `.env`
    /// file.  Empty variables are ignored.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Same as [`apply_env`](Self::apply_env) with an injectable lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_DEEPGRAM_KEY) {
            self.stt.api_key = Some(key);
        }
        if let Some(key) = get(ENV_GROQ_KEY) {
            self.llm.api_key = Some(key);
        }
        if let Some(key) = get(ENV_MINIMAX_KEY) {
            self.tts.api_key = Some(key);
        }
        if let Some(group) = get(ENV_MINIMAX_GROUP) {
            self.tts.group_id = Some(group);
        }
    }

    /// Look up a voice by the name the front end uses.
    pub fn voice(&self, name: &str) -> Option<&VoiceProfile> {
        self.voices.get(name)
    }
}

/// Seed the process environment from `.env` in the working directory, or
/// from the config directory when the working directory has none.
///
/// Missing files are not an error; variables already set win.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => log::info!("config: loaded {}", path.display()),
        Err(_) => {
            let path = AppPaths::new().env_file;
            if path.exists() {
                if let Err(e) = dotenvy::from_path(&path) {
                    log::warn!("config: failed to read {}: {e}", path.display());
                }
            } else {
                log::debug!("config: no .env file found, using process environment");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
