//! Voice activity classification
//!
//! Wraps the WebRTC VAD. It only accepts 8/16/32/48 kHz audio in 10, 20 or
//! 30 ms frames; anything else is a per-frame error, which the recorder
//! treats as "not speech".

use webrtc_vad::{SampleRate, Vad, VadMode};

use crate::{Error, Result};

/// Per-frame speech classifier
pub trait VoiceActivity {
    /// Whether `frame` contains speech
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be classified
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool>;
}

/// WebRTC voice activity detector
pub struct WebRtcVad {
    vad: Vad,
    sample_rate: u32,
}

impl WebRtcVad {
    /// Create a detector for `sample_rate` at aggressiveness `mode` (0-3)
    ///
    /// # Errors
    ///
    /// Returns error for sample rates or modes WebRTC does not support
    pub fn new(sample_rate: u32, mode: u8) -> Result<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(Error::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000 or 48000 Hz, got {other}"
                )));
            }
        };

        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => return Err(Error::Config(format!("VAD mode must be 0-3, got {other}"))),
        };

        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(rate);

        tracing::debug!(sample_rate, mode, "voice activity detector initialized");
        Ok(Self { vad, sample_rate })
    }

    /// Configured sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl VoiceActivity for WebRtcVad {
    fn is_speech(&mut self, frame: &[i16]) -> Result<bool> {
        self.vad.is_voice_segment(frame).map_err(|()| {
            Error::Audio(format!(
                "VAD rejected a {}-sample frame at {} Hz",
                frame.len(),
                self.sample_rate
            ))
        })
    }
}

/// Classifier that never reports speech, leaving the energy gate to decide
#[derive(Debug, Clone, Copy, Default)]
pub struct EnergyOnly;

impl VoiceActivity for EnergyOnly {
    fn is_speech(&mut self, _frame: &[i16]) -> Result<bool> {
        Ok(false)
    }
}
