//! Configuration management for the companion runtime

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::device::{Backoff, Canvas, LinkPolicy, LinkSettings, PixelFormat};
use crate::voice::RecorderSettings;
use crate::{Error, Result};

/// Sample rates the WebRTC classifier accepts
const VAD_SAMPLE_RATES: [u32; 4] = [8_000, 16_000, 32_000, 48_000];

/// Frame lengths the WebRTC classifier accepts
const VAD_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Companion runtime configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Microphone and endpointing
    pub audio: AudioConfig,

    /// Serial link to the display/motor controller
    pub device: DeviceConfig,

    /// Display assets
    pub display: DisplayConfig,

    /// Turn-taking policy
    pub conversation: ConversationConfig,

    /// Dialogue service
    pub dialogue: DialogueConfig,
}

/// Audio capture and endpointing configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Frame length in milliseconds
    pub frame_ms: u32,

    /// RMS level (16-bit sample units) above which a frame counts as active
    pub energy_threshold: f32,

    /// Run the WebRTC voice classifier alongside the energy gate
    pub vad_enabled: bool,

    /// WebRTC aggressiveness, 0 (quality) to 3 (very aggressive)
    pub vad_mode: u8,

    /// Consecutive active frames needed to start an utterance
    pub start_frames: usize,

    /// Trailing silence that ends an utterance
    pub silence: Duration,

    /// Give up if no speech starts within this window
    pub initial_silence: Duration,

    /// Hard cap on one recording
    pub max_duration: Duration,

    /// Utterances shorter than this are discarded
    pub min_duration: Duration,

    /// WAV played when the wake word fires (a tone if unset)
    pub ack_sound: Option<PathBuf>,

    /// How long a frame read may stall before the stream counts as failed
    pub read_timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 30,
            energy_threshold: 600.0,
            vad_enabled: true,
            vad_mode: 2,
            start_frames: 3,
            silence: Duration::from_millis(1500),
            initial_silence: Duration::from_secs(5),
            max_duration: Duration::from_secs(30),
            min_duration: Duration::from_millis(500),
            ack_sound: None,
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl AudioConfig {
    /// Samples per frame
    #[must_use]
    pub fn frame_len(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Endpointing parameters for the turn recorder
    #[must_use]
    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            sample_rate: self.sample_rate,
            frame_len: self.frame_len(),
            energy_threshold: self.energy_threshold,
            start_frames: self.start_frames,
            silence: self.silence,
            initial_silence: self.initial_silence,
            max_duration: self.max_duration,
            min_duration: self.min_duration,
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Explicit port path; discovery is skipped when set
    pub port: Option<String>,

    /// Substring matched against port descriptions
    pub description_match: String,

    /// Used when discovery finds nothing
    pub fallback_port: String,

    /// Baud rate
    pub baud: u32,

    /// Per-attempt open timeout
    pub open_timeout: Duration,

    /// Reply timeout for commands
    pub command_timeout: Duration,

    /// Ack window per image attempt
    pub image_timeout: Duration,

    /// Extra image attempts after the first
    pub image_retries: u32,

    /// Pause between image attempts
    pub retry_delay: Duration,

    /// Open attempts per reconnect
    pub open_attempts: u32,

    /// Base delay between open attempts (grows by the same amount each retry)
    pub open_backoff: Duration,

    /// Display canvas
    pub canvas: Canvas,

    /// Image payload encoding
    pub pixel_format: PixelFormat,

    /// JPEG quality (1-100)
    pub jpeg_quality: u8,

    /// Tell the firmware about conversation state changes
    pub announce_state: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            description_match: "USB Serial".to_string(),
            fallback_port: "/dev/ttyACM0".to_string(),
            baud: 115_200,
            open_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_secs(1),
            image_timeout: Duration::from_millis(500),
            image_retries: 2,
            retry_delay: Duration::from_millis(100),
            open_attempts: 3,
            open_backoff: Duration::from_millis(250),
            canvas: Canvas::default(),
            pixel_format: PixelFormat::Jpeg,
            jpeg_quality: 85,
            announce_state: true,
        }
    }
}

impl DeviceConfig {
    /// Driver-level timing for the link
    #[must_use]
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            baud: self.baud,
            open_timeout: self.open_timeout,
            command_timeout: self.command_timeout,
            retry_delay: self.retry_delay,
        }
    }

    /// Reconnect/retry policy for a link at `path`
    #[must_use]
    pub fn link_policy(&self, path: String) -> LinkPolicy {
        LinkPolicy {
            path,
            open_attempts: self.open_attempts,
            backoff: Backoff::Incremental {
                base: self.open_backoff,
                step: self.open_backoff,
            },
            image_timeout: self.image_timeout,
            image_retries: self.image_retries,
        }
    }
}

/// Display asset configuration
#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// Logo shown while waiting for the wake word
    pub idle_image: Option<PathBuf>,

    /// Shown while recording a turn
    pub listening_image: Option<PathBuf>,

    /// Shown while the dialogue service works
    pub thinking_image: Option<PathBuf>,

    /// Looped while a reply is spoken
    pub talking_gif: Option<PathBuf>,

    /// Cadence of the talking loop
    pub frame_delay: Duration,

    /// Steps in the closing fade
    pub fade_steps: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            idle_image: None,
            listening_image: None,
            thinking_image: None,
            talking_gif: None,
            frame_delay: Duration::from_millis(80),
            fade_steps: 8,
        }
    }
}

/// Which wake detector to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeMode {
    /// Energy-gated segments verified by transcription against the wake words
    #[default]
    Transcript,
    /// Any sustained speech burst wakes the device
    Energy,
}

/// Turn-taking policy
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Consecutive silent turns that end a conversation
    pub max_silence: u32,

    /// Marker the dialogue model appends to end the conversation
    pub end_marker: String,

    /// Wake phrases
    pub wake_words: Vec<String>,

    /// Wake detector variant
    pub wake_mode: WakeMode,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_silence: 2,
            end_marker: "[END_CONVERSATION]".to_string(),
            wake_words: vec!["hey hearth".to_string()],
            wake_mode: WakeMode::Transcript,
        }
    }
}

/// Dialogue service configuration
#[derive(Debug, Clone)]
pub struct DialogueConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// Bearer token
    pub api_key: Option<String>,

    /// Transcription model
    pub stt_model: String,

    /// Chat model
    pub chat_model: String,

    /// Speech model
    pub tts_model: String,

    /// Speech voice
    pub tts_voice: String,

    /// System prompt for the chat model
    pub system_prompt: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            stt_model: "whisper-1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            system_prompt: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Load configuration, reading overrides through `env` instead of the
    /// process environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load_with_env(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let fc = file::load_config_file(path);
        let mut config = Self::default();

        let audio = &mut config.audio;
        let fa = fc.audio;
        audio.sample_rate = fa.sample_rate.unwrap_or(audio.sample_rate);
        audio.frame_ms = fa.frame_ms.unwrap_or(audio.frame_ms);
        audio.energy_threshold = fa.energy_threshold.unwrap_or(audio.energy_threshold);
        audio.vad_enabled = fa.vad_enabled.unwrap_or(audio.vad_enabled);
        audio.vad_mode = fa.vad_mode.unwrap_or(audio.vad_mode);
        audio.start_frames = fa.start_frames.unwrap_or(audio.start_frames);
        audio.silence = secs_or(fa.silence_secs, audio.silence);
        audio.initial_silence = secs_or(fa.initial_silence_secs, audio.initial_silence);
        audio.max_duration = secs_or(fa.max_duration_secs, audio.max_duration);
        audio.min_duration = secs_or(fa.min_duration_secs, audio.min_duration);
        audio.ack_sound = fa.ack_sound;
        audio.read_timeout = millis_or(fa.read_timeout_ms, audio.read_timeout);

        let device = &mut config.device;
        let fd = fc.device;
        device.port = env("HEARTH_SERIAL_PORT").or(fd.port);
        if let Some(m) = fd.description_match {
            device.description_match = m;
        }
        if let Some(p) = fd.fallback_port {
            device.fallback_port = p;
        }
        device.baud = env("HEARTH_SERIAL_BAUD")
            .and_then(|s| s.parse().ok())
            .or(fd.baud)
            .unwrap_or(device.baud);
        device.open_timeout = millis_or(fd.open_timeout_ms, device.open_timeout);
        device.command_timeout = millis_or(fd.command_timeout_ms, device.command_timeout);
        device.image_timeout = millis_or(fd.image_timeout_ms, device.image_timeout);
        device.image_retries = fd.image_retries.unwrap_or(device.image_retries);
        device.retry_delay = millis_or(fd.retry_delay_ms, device.retry_delay);
        device.open_attempts = fd.open_attempts.unwrap_or(device.open_attempts);
        device.open_backoff = millis_or(fd.open_backoff_ms, device.open_backoff);
        device.canvas = Canvas {
            width: fd.canvas_width.unwrap_or(device.canvas.width),
            height: fd.canvas_height.unwrap_or(device.canvas.height),
        };
        device.pixel_format = fd.pixel_format.unwrap_or(device.pixel_format);
        device.jpeg_quality = fd.jpeg_quality.unwrap_or(device.jpeg_quality);
        device.announce_state = fd.announce_state.unwrap_or(device.announce_state);

        let display = &mut config.display;
        let fv = fc.display;
        display.idle_image = fv.idle_image;
        display.listening_image = fv.listening_image;
        display.thinking_image = fv.thinking_image;
        display.talking_gif = fv.talking_gif;
        display.frame_delay = millis_or(fv.frame_delay_ms, display.frame_delay);
        display.fade_steps = fv.fade_steps.unwrap_or(display.fade_steps);

        let conversation = &mut config.conversation;
        let fcv = fc.conversation;
        conversation.max_silence = env("HEARTH_MAX_SILENCE")
            .and_then(|s| s.parse().ok())
            .or(fcv.max_silence)
            .unwrap_or(conversation.max_silence);
        if let Some(marker) = fcv.end_marker {
            conversation.end_marker = marker;
        }
        if let Some(words) = env("HEARTH_WAKE_WORDS")
            .map(|s| s.split(',').map(str::trim).map(String::from).collect())
            .or(fcv.wake_words)
        {
            conversation.wake_words = words;
        }
        conversation.wake_mode = fcv.wake_mode.unwrap_or(conversation.wake_mode);

        let dialogue = &mut config.dialogue;
        let fdl = fc.dialogue;
        if let Some(url) = env("HEARTH_DIALOGUE_URL").or(fdl.base_url) {
            dialogue.base_url = url;
        }
        dialogue.api_key = env("OPENAI_API_KEY").or(fdl.api_key);
        if let Some(m) = fdl.stt_model {
            dialogue.stt_model = m;
        }
        if let Some(m) = env("HEARTH_CHAT_MODEL").or(fdl.chat_model) {
            dialogue.chat_model = m;
        }
        if let Some(m) = fdl.tts_model {
            dialogue.tts_model = m;
        }
        if let Some(v) = fdl.tts_voice {
            dialogue.tts_voice = v;
        }
        if let Some(p) = fdl.system_prompt {
            dialogue.system_prompt = p;
        }
        if let Some(secs) = fdl.request_timeout_secs {
            dialogue.request_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the runtime relies on
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if !VAD_SAMPLE_RATES.contains(&audio.sample_rate) {
            return Err(Error::Config(format!(
                "audio.sample_rate must be one of {VAD_SAMPLE_RATES:?}, got {}",
                audio.sample_rate
            )));
        }
        if !VAD_FRAME_MS.contains(&audio.frame_ms) {
            return Err(Error::Config(format!(
                "audio.frame_ms must be one of {VAD_FRAME_MS:?}, got {}",
                audio.frame_ms
            )));
        }
        if audio.vad_mode > 3 {
            return Err(Error::Config(format!(
                "audio.vad_mode must be 0-3, got {}",
                audio.vad_mode
            )));
        }
        if audio.start_frames == 0 {
            return Err(Error::Config("audio.start_frames must be at least 1".to_string()));
        }
        if audio.min_duration > audio.max_duration {
            return Err(Error::Config(
                "audio.min_duration_secs exceeds audio.max_duration_secs".to_string(),
            ));
        }
        if self.device.canvas.width == 0 || self.device.canvas.height == 0 {
            return Err(Error::Config("device canvas must be non-empty".to_string()));
        }
        if self.conversation.max_silence == 0 {
            return Err(Error::Config(
                "conversation.max_silence must be at least 1".to_string(),
            ));
        }
        if self.conversation.wake_mode == WakeMode::Transcript
            && self.conversation.wake_words.iter().all(|w| w.trim().is_empty())
        {
            return Err(Error::Config(
                "conversation.wake_words required for transcript wake mode".to_string(),
            ));
        }
        Ok(())
    }
}

fn secs_or(value: Option<f32>, default: Duration) -> Duration {
    value
        .and_then(|s| Duration::try_from_secs_f32(s).ok())
        .unwrap_or(default)
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}
