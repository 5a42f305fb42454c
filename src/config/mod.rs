//! Configuration module for the voice streaming pipeline.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for each subsystem,
//! `AppPaths` for cross-platform data directories, TOML persistence via
//! `AppConfig::load` / `AppConfig::save`, and `.env` / environment overlays
//! for API keys.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    load_dotenv, AppConfig, AudioConfig, InterruptionConfig, LlmConfig, ReconnectConfig,
    SttConfig, TtsConfig, VadConfig, VoiceProfile, VoiceSettings,
};
