//! TOML configuration file loading
//!
//! Supports `~/.config/hearth/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::device::PixelFormat;

use super::WakeMode;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HearthConfigFile {
    /// Microphone and endpointing
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Serial link to the display/motor controller
    #[serde(default)]
    pub device: DeviceFileConfig,

    /// Display assets
    #[serde(default)]
    pub display: DisplayFileConfig,

    /// Turn-taking policy
    #[serde(default)]
    pub conversation: ConversationFileConfig,

    /// Dialogue service
    #[serde(default)]
    pub dialogue: DialogueFileConfig,
}

/// Audio capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_ms: Option<u32>,
    pub energy_threshold: Option<f32>,
    pub vad_enabled: Option<bool>,
    pub vad_mode: Option<u8>,
    pub start_frames: Option<usize>,
    pub silence_secs: Option<f32>,
    pub initial_silence_secs: Option<f32>,
    pub max_duration_secs: Option<f32>,
    pub min_duration_secs: Option<f32>,
    pub ack_sound: Option<PathBuf>,
    pub read_timeout_ms: Option<u64>,
}

/// Serial link configuration
#[derive(Debug, Default, Deserialize)]
pub struct DeviceFileConfig {
    /// Explicit port path; skips discovery
    pub port: Option<String>,
    /// Substring matched against port descriptions during discovery
    pub description_match: Option<String>,
    pub fallback_port: Option<String>,
    pub baud: Option<u32>,
    pub open_timeout_ms: Option<u64>,
    pub command_timeout_ms: Option<u64>,
    pub image_timeout_ms: Option<u64>,
    pub image_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub open_attempts: Option<u32>,
    pub open_backoff_ms: Option<u64>,
    pub canvas_width: Option<u32>,
    pub canvas_height: Option<u32>,
    pub pixel_format: Option<PixelFormat>,
    pub jpeg_quality: Option<u8>,
    pub announce_state: Option<bool>,
}

/// Display asset configuration
#[derive(Debug, Default, Deserialize)]
pub struct DisplayFileConfig {
    pub idle_image: Option<PathBuf>,
    pub listening_image: Option<PathBuf>,
    pub thinking_image: Option<PathBuf>,
    pub talking_gif: Option<PathBuf>,
    pub frame_delay_ms: Option<u64>,
    pub fade_steps: Option<u32>,
}

/// Conversation policy configuration
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub max_silence: Option<u32>,
    pub end_marker: Option<String>,
    pub wake_words: Option<Vec<String>>,
    pub wake_mode: Option<WakeMode>,
}

/// Dialogue service configuration
#[derive(Debug, Default, Deserialize)]
pub struct DialogueFileConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub stt_model: Option<String>,
    pub chat_model: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub system_prompt: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

/// Load the TOML config file from `path`, or the standard path
///
/// Returns `HearthConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> HearthConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return HearthConfigFile::default();
    };

    if !path.exists() {
        return HearthConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HearthConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HearthConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/hearth/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hearth").join("config.toml"))
}
