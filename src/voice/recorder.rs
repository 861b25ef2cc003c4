//! Turn endpointing
//!
//! Cuts one utterance out of a live frame stream. A frame is active when the
//! voice classifier says speech or its RMS clears the energy threshold.
//! `start_frames` consecutive active frames start the utterance (the run
//! itself is kept), and it ends once the trailing silence exceeds the
//! configured window. Two ceilings bound the loop: no speech within the
//! initial-silence window, and the maximum utterance length.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::capture::{AudioSource, rms, samples_to_wav, write_wav};
use super::vad::VoiceActivity;
use crate::Result;

/// Endpointing parameters
#[derive(Debug, Clone)]
pub struct RecorderSettings {
    /// Samples per second
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_len: usize,
    /// RMS above which a frame is active regardless of the classifier
    pub energy_threshold: f32,
    /// Consecutive active frames that start an utterance
    pub start_frames: usize,
    /// Trailing silence that ends an utterance
    pub silence: Duration,
    /// Give up if speech has not started within this window
    pub initial_silence: Duration,
    /// Hard cap on the utterance
    pub max_duration: Duration,
    /// Shorter utterances are discarded
    pub min_duration: Duration,
}

impl RecorderSettings {
    /// Duration of one frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        span(self.frame_len, self.sample_rate)
    }

    /// Frames needed to cover `window`, rounded up
    #[must_use]
    pub fn frames_covering(&self, window: Duration) -> usize {
        let frame = self.frame_duration().as_nanos();
        if frame == 0 {
            return 0;
        }
        usize::try_from(window.as_nanos().div_ceil(frame)).unwrap_or(usize::MAX)
    }

    /// Most whole frames that fit inside `window`
    #[must_use]
    pub fn frames_within(&self, window: Duration) -> usize {
        let frame = self.frame_duration().as_nanos();
        if frame == 0 {
            return 0;
        }
        usize::try_from(window.as_nanos() / frame).unwrap_or(usize::MAX)
    }
}

/// Playing time of `samples` mono samples at `sample_rate`
fn span(samples: usize, sample_rate: u32) -> Duration {
    let nanos = (samples as u128 * 1_000_000_000) / u128::from(sample_rate.max(1));
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// One captured turn of speech
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    samples: Vec<i16>,
    sample_rate: u32,
}

impl Utterance {
    /// Wrap captured samples
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Raw mono PCM
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Samples per second
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playing time
    #[must_use]
    pub fn duration(&self) -> Duration {
        span(self.samples.len(), self.sample_rate)
    }

    /// Encode as a 16-bit mono WAV container
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, self.sample_rate)
    }

    /// Write as a 16-bit mono WAV file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        write_wav(path, &self.samples, self.sample_rate)
    }
}

/// Outcome of one recording turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// Speech was captured
    Utterance(Utterance),
    /// No usable speech: nothing started, too short, or shutdown
    Nothing,
    /// The audio stream failed mid-turn; the source should be reopened
    StreamFailed(String),
}

impl Capture {
    /// The utterance, if one was captured
    #[must_use]
    pub fn into_utterance(self) -> Option<Utterance> {
        match self {
            Self::Utterance(u) => Some(u),
            Self::Nothing | Self::StreamFailed(_) => None,
        }
    }
}

/// Converts a frame stream into at most one utterance per call
pub struct TurnRecorder {
    settings: RecorderSettings,
    vad: Box<dyn VoiceActivity>,
}

impl TurnRecorder {
    /// Create a recorder with the given classifier
    #[must_use]
    pub fn new(settings: RecorderSettings, vad: Box<dyn VoiceActivity>) -> Self {
        Self { settings, vad }
    }

    /// Endpointing parameters
    #[must_use]
    pub const fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Whether a frame counts toward speech
    ///
    /// A classifier error on this frame counts as not speech.
    pub fn is_active(&mut self, frame: &[i16]) -> bool {
        let voiced = self.vad.is_speech(frame).unwrap_or_else(|e| {
            tracing::trace!(error = %e, "VAD failed on frame");
            false
        });
        voiced || rms(frame) > self.settings.energy_threshold
    }

    /// Record one turn from `source`
    ///
    /// Blocks on frame reads. `shutdown` is checked between frames.
    pub fn capture(&mut self, source: &mut dyn AudioSource, shutdown: &CancellationToken) -> Capture {
        let silence_limit = self.settings.frames_covering(self.settings.silence);
        let initial_limit = self.settings.frames_covering(self.settings.initial_silence).max(1);
        let max_frames = self.settings.frames_within(self.settings.max_duration).max(1);
        let start_frames = self.settings.start_frames.max(1);

        let mut onset: Vec<Vec<i16>> = Vec::with_capacity(start_frames);
        let mut samples: Vec<i16> = Vec::new();
        let mut frames_waited = 0_usize;
        let mut utterance_frames = 0_usize;
        let mut silent_run = 0_usize;
        let mut voiced_len = 0_usize;
        let mut max_frame_len = 0_usize;

        loop {
            if shutdown.is_cancelled() {
                tracing::debug!("capture interrupted by shutdown");
                return Capture::Nothing;
            }

            let frame = match source.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(error = %e, "audio stream failed during capture");
                    return Capture::StreamFailed(e.to_string());
                }
            };
            max_frame_len = max_frame_len.max(frame.len());
            let active = self.is_active(&frame);

            if utterance_frames == 0 {
                frames_waited += 1;
                if active {
                    onset.push(frame);
                    if onset.len() >= start_frames {
                        utterance_frames = onset.len();
                        for f in onset.drain(..) {
                            samples.extend_from_slice(&f);
                        }
                        voiced_len = samples.len();
                        tracing::debug!(frames_waited, "speech started");
                    }
                } else {
                    onset.clear();
                }

                if utterance_frames == 0 {
                    if frames_waited >= initial_limit {
                        tracing::debug!(frames = frames_waited, "no speech before initial-silence limit");
                        return Capture::Nothing;
                    }
                    continue;
                }
            } else {
                samples.extend_from_slice(&frame);
                utterance_frames += 1;

                if active {
                    silent_run = 0;
                    voiced_len = samples.len();
                } else {
                    silent_run += 1;
                    if silent_run > silence_limit {
                        tracing::debug!(frames = utterance_frames, "end of speech");
                        break;
                    }
                }
            }

            if utterance_frames >= max_frames {
                tracing::debug!(frames = utterance_frames, "max utterance duration reached");
                break;
            }
        }

        samples.truncate(voiced_len.min(max_frames * max_frame_len));
        let utterance = Utterance::new(samples, self.settings.sample_rate);

        if utterance.duration() < self.settings.min_duration {
            tracing::debug!(duration = ?utterance.duration(), "utterance below minimum duration");
            return Capture::Nothing;
        }

        tracing::info!(duration = ?utterance.duration(), "utterance captured");
        Capture::Utterance(utterance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RecorderSettings {
        RecorderSettings {
            sample_rate: 16_000,
            frame_len: 480,
            energy_threshold: 600.0,
            start_frames: 3,
            silence: Duration::from_millis(1500),
            initial_silence: Duration::from_secs(5),
            max_duration: Duration::from_secs(30),
            min_duration: Duration::from_millis(500),
        }
    }

    #[test]
    fn frame_arithmetic() {
        let s = settings();
        assert_eq!(s.frame_duration(), Duration::from_millis(30));
        assert_eq!(s.frames_covering(Duration::from_millis(1500)), 50);
        assert_eq!(s.frames_covering(Duration::from_millis(1510)), 51);
        assert_eq!(s.frames_within(Duration::from_millis(1510)), 50);
        assert_eq!(s.frames_within(Duration::from_secs(30)), 1000);
    }

    #[test]
    fn utterance_duration() {
        let u = Utterance::new(vec![0; 16_000 * 3], 16_000);
        assert_eq!(u.duration(), Duration::from_secs(3));
        assert!(Capture::Utterance(u).into_utterance().is_some());
        assert!(Capture::Nothing.into_utterance().is_none());
    }
}
