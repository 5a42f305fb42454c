//! Cross-platform application paths using the `dirs` crate.
//!
//! Config dir (settings + `.env` fallback):
//!   Windows: %APPDATA%\voice-streaming\
//!   macOS:   ~/Library/Application Support/voice-streaming/
//!   Linux:   ~/.config/voice-streaming/

use std::path::PathBuf;

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml` and the fallback `.env`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Full path to the fallback `.env`.
    pub env_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "voice-streaming";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        Self {
            settings_file: config_dir.join("settings.toml"),
            env_file: config_dir.join(".env"),
            config_dir,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
