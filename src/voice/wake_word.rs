//! Wake word detection
//!
//! Both detectors segment the frame stream on energy first: a burst of
//! speech followed by a short pause makes one segment. The energy detector
//! fires on any such segment; the transcript detector sends the segment to
//! the dialogue service and fires only when a wake phrase was spoken.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use super::capture::{rms, write_wav};
use crate::dialogue::DialogueSession;
use crate::{Error, Result};

/// Voiced audio needed before a segment counts (0.3 s at 16 kHz)
const MIN_SPEECH_MS: u64 = 300;

/// Pause that closes a segment
const SEGMENT_SILENCE_MS: u64 = 500;

/// Segments longer than this are cut and evaluated anyway
const MAX_SEGMENT_MS: u64 = 6000;

/// Result of analysing one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detection {
    /// Score per configured keyword, empty when nothing was evaluated
    pub scores: Vec<f32>,
    /// Index of the strongest keyword, if one fired
    pub keyword: Option<usize>,
}

impl Detection {
    /// Nothing detected
    #[must_use]
    pub const fn none() -> Self {
        Self {
            scores: Vec::new(),
            keyword: None,
        }
    }

    /// Keyword `index` of `count` fired with full confidence
    #[must_use]
    pub fn fired(index: usize, count: usize) -> Self {
        let mut scores = vec![0.0; count.max(index + 1)];
        scores[index] = 1.0;
        Self {
            scores,
            keyword: Some(index),
        }
    }

    /// Whether a keyword fired
    #[must_use]
    pub const fn is_detected(&self) -> bool {
        self.keyword.is_some()
    }
}

/// Keyword spotter fed one frame at a time
#[async_trait]
pub trait WakeWordDetector: Send {
    /// Keywords this detector reports, indexed by [`Detection::keyword`]
    fn keywords(&self) -> &[String];

    /// Analyse the next frame
    ///
    /// # Errors
    ///
    /// Returns error if the detector itself failed (not for "no detection")
    async fn process(&mut self, frame: &[i16]) -> Result<Detection>;

    /// Drop buffered audio and start fresh
    fn reset(&mut self);

    /// Text spoken after the wake phrase in the same breath, if any
    fn take_command(&mut self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Speaking,
}

/// Energy-gated speech segmenter
#[derive(Debug)]
struct Segmenter {
    threshold: f32,
    sample_rate: u32,
    state: SegmentState,
    buffer: Vec<i16>,
    voiced: usize,
    silence: usize,
}

impl Segmenter {
    fn new(threshold: f32, sample_rate: u32) -> Self {
        Self {
            threshold,
            sample_rate,
            state: SegmentState::Idle,
            buffer: Vec::new(),
            voiced: 0,
            silence: 0,
        }
    }

    fn samples_for(&self, ms: u64) -> usize {
        usize::try_from(u64::from(self.sample_rate) * ms / 1000).unwrap_or(usize::MAX)
    }

    /// Feed a frame; returns a finished segment
    fn push(&mut self, frame: &[i16]) -> Option<Vec<i16>> {
        let energy = rms(frame);
        let is_speech = energy > self.threshold;

        match self.state {
            SegmentState::Idle => {
                if is_speech {
                    self.state = SegmentState::Speaking;
                    self.buffer.clear();
                    self.buffer.extend_from_slice(frame);
                    self.voiced = frame.len();
                    self.silence = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
                None
            }
            SegmentState::Speaking => {
                self.buffer.extend_from_slice(frame);
                if is_speech {
                    self.voiced += frame.len();
                    self.silence = 0;
                } else {
                    self.silence += frame.len();
                }

                let closed = self.silence > self.samples_for(SEGMENT_SILENCE_MS);
                let too_long = self.buffer.len() >= self.samples_for(MAX_SEGMENT_MS);
                if !closed && !too_long {
                    return None;
                }

                let enough = self.voiced >= self.samples_for(MIN_SPEECH_MS);
                let segment = std::mem::take(&mut self.buffer);
                self.reset();

                if enough {
                    tracing::debug!(samples = segment.len(), "speech segment complete");
                    Some(segment)
                } else {
                    tracing::trace!("segment too short, resetting");
                    None
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = SegmentState::Idle;
        self.buffer.clear();
        self.voiced = 0;
        self.silence = 0;
    }
}

/// Wakes on any sustained burst of speech
#[derive(Debug)]
pub struct EnergyWakeDetector {
    segmenter: Segmenter,
    labels: Vec<String>,
}

impl EnergyWakeDetector {
    /// Create a detector with an RMS `threshold` in 16-bit sample units
    #[must_use]
    pub fn new(threshold: f32, sample_rate: u32) -> Self {
        Self {
            segmenter: Segmenter::new(threshold, sample_rate),
            labels: vec!["speech".to_string()],
        }
    }
}

#[async_trait]
impl WakeWordDetector for EnergyWakeDetector {
    fn keywords(&self) -> &[String] {
        &self.labels
    }

    async fn process(&mut self, frame: &[i16]) -> Result<Detection> {
        Ok(match self.segmenter.push(frame) {
            Some(_) => Detection::fired(0, 1),
            None => Detection::none(),
        })
    }

    fn reset(&mut self) {
        self.segmenter.reset();
    }
}

/// Wakes when a transcribed speech segment contains a wake phrase
pub struct TranscriptWakeDetector {
    segmenter: Segmenter,
    session: Arc<dyn DialogueSession>,
    wake_words: Vec<String>,
    scratch: TempDir,
    command: Option<String>,
}

impl TranscriptWakeDetector {
    /// Create a detector for `wake_words` (matched case-insensitively)
    ///
    /// # Errors
    ///
    /// Returns error if no wake word is given or the scratch directory
    /// cannot be created
    pub fn new(
        wake_words: Vec<String>,
        session: Arc<dyn DialogueSession>,
        threshold: f32,
        sample_rate: u32,
    ) -> Result<Self> {
        let normalized: Vec<String> = wake_words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        if normalized.is_empty() {
            return Err(Error::WakeWord("no wake words configured".to_string()));
        }

        let scratch = tempfile::Builder::new().prefix("hearth-wake").tempdir()?;
        tracing::debug!(wake_words = ?normalized, "wake word detector initialized");

        Ok(Self {
            segmenter: Segmenter::new(threshold, sample_rate),
            session,
            wake_words: normalized,
            scratch,
            command: None,
        })
    }

    fn segment_path(&self) -> PathBuf {
        self.scratch.path().join("segment.wav")
    }
}

#[async_trait]
impl WakeWordDetector for TranscriptWakeDetector {
    fn keywords(&self) -> &[String] {
        &self.wake_words
    }

    async fn process(&mut self, frame: &[i16]) -> Result<Detection> {
        let Some(segment) = self.segmenter.push(frame) else {
            return Ok(Detection::none());
        };

        let path = self.segment_path();
        write_wav(&path, &segment, self.segmenter.sample_rate)?;

        let transcript = match self.session.transcribe(&path).await {
            Ok(text) => text,
            Err(e) => {
                // Wake verification is retried on the next segment
                tracing::warn!(error = %e, "wake segment transcription failed");
                return Ok(Detection::none());
            }
        };

        let Some((index, command)) = match_wake_word(&self.wake_words, &transcript) else {
            tracing::debug!(transcript, "no wake word in segment");
            return Ok(Detection::none());
        };

        tracing::info!(wake_word = %self.wake_words[index], transcript, "wake word detected");
        self.command = Some(command).filter(|c| !c.is_empty());
        Ok(Detection::fired(index, self.wake_words.len()))
    }

    fn reset(&mut self) {
        self.segmenter.reset();
        self.command = None;
    }

    fn take_command(&mut self) -> Option<String> {
        self.command.take()
    }
}

/// Find the earliest wake phrase in `transcript`
///
/// Returns its index and the text following it, with leading punctuation
/// and whitespace removed. `wake_words` must already be lowercase.
#[must_use]
pub fn match_wake_word(wake_words: &[String], transcript: &str) -> Option<(usize, String)> {
    let lower = transcript.to_lowercase();

    wake_words
        .iter()
        .enumerate()
        .filter_map(|(i, w)| lower.find(w.as_str()).map(|pos| (pos, i, w.len())))
        .min_by_key(|&(pos, _, _)| pos)
        .map(|(pos, index, len)| {
            // Lowercasing can change byte lengths outside ASCII
            let rest = if lower.len() == transcript.len() {
                transcript.get(pos + len..).unwrap_or_default()
            } else {
                lower.get(pos + len..).unwrap_or_default()
            };
            let command = rest
                .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.' | '!' | '?'))
                .trim_end()
                .to_string();
            (index, command)
        })
}
