//! Audio capture from microphone
//!
//! The cpal callback pushes mono 16-bit samples into a shared queue;
//! [`AudioSource::read_frame`] cuts that queue into fixed-size frames.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};

use crate::{Error, Result};

/// Default capture rate (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Poll interval while waiting for the callback to fill a frame
const READ_POLL: Duration = Duration::from_millis(5);

/// Queue cap; older audio is dropped past this (10 s at 16 kHz)
const MAX_QUEUED: usize = 160_000;

/// A stream of fixed-size PCM frames
pub trait AudioSource {
    /// Samples per second
    fn sample_rate(&self) -> u32;

    /// Samples per frame; identical for every frame of one stream
    fn frame_len(&self) -> usize;

    /// Block until the next frame is available
    ///
    /// # Errors
    ///
    /// Returns `Error::Capture` if the stream failed or stalled
    fn read_frame(&mut self) -> Result<Vec<i16>>;

    /// Drop any audio queued but not yet read
    fn clear(&mut self) {}
}

/// Opens microphone streams
///
/// The orchestrator reopens through this after a stream failure, since the
/// device may have been unplugged and remounted.
pub trait MicrophoneFactory {
    /// Open and start a fresh stream
    ///
    /// # Errors
    ///
    /// Returns error if no input device can be opened
    fn open(&self) -> Result<Box<dyn AudioSource>>;
}

/// Captures audio from the default input device
pub struct Microphone {
    _stream: Stream,
    config: StreamConfig,
    buffer: Arc<Mutex<VecDeque<i16>>>,
    failed: Arc<AtomicBool>,
    frame_len: usize,
    read_timeout: Duration,
}

impl Microphone {
    /// Open the default input device and start capturing
    ///
    /// Prefers a mono config at `sample_rate`; multi-channel devices are
    /// reduced to their first channel.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn open(sample_rate: u32, frame_len: usize, read_timeout: Duration) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let rate = SampleRate(sample_rate);
        let supports = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
        };
        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(supports)
            .min_by_key(cpal::SupportedStreamConfigRange::channels)
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();
        let channels = usize::from(config.channels).max(1);

        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(frame_len * 4)));
        let failed = Arc::new(AtomicBool::new(false));

        let sink = Arc::clone(&buffer);
        let failed_flag = Arc::clone(&failed);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend(data.chunks(channels).map(|c| to_i16(c[0])));
                        let excess = buf.len().saturating_sub(MAX_QUEUED);
                        buf.drain(..excess);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    failed_flag.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels,
            frame_len,
            "audio capture started"
        );

        Ok(Self {
            _stream: stream,
            config,
            buffer,
            failed,
            frame_len,
            read_timeout,
        })
    }
}

impl AudioSource for Microphone {
    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn read_frame(&mut self) -> Result<Vec<i16>> {
        let deadline = Instant::now() + self.read_timeout;

        loop {
            if self.failed.load(Ordering::Relaxed) {
                return Err(Error::Capture("input stream reported an error".to_string()));
            }

            {
                let mut buf = self
                    .buffer
                    .lock()
                    .map_err(|_| Error::Capture("capture buffer poisoned".to_string()))?;
                if buf.len() >= self.frame_len {
                    return Ok(buf.drain(..self.frame_len).collect());
                }
            }

            if Instant::now() >= deadline {
                return Err(Error::Capture(format!(
                    "no audio within {:?}",
                    self.read_timeout
                )));
            }
            std::thread::sleep(READ_POLL);
        }
    }

    fn clear(&mut self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        tracing::debug!("audio capture stopped");
    }
}

/// Opens [`Microphone`]s on the default input device
#[derive(Debug, Clone)]
pub struct CpalMicrophones {
    /// Capture rate
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_len: usize,
    /// Stall limit per frame read
    pub read_timeout: Duration,
}

impl MicrophoneFactory for CpalMicrophones {
    fn open(&self) -> Result<Box<dyn AudioSource>> {
        let mic = Microphone::open(self.sample_rate, self.frame_len, self.read_timeout)?;
        Ok(Box::new(mic))
    }
}

/// RMS level of a frame, in 16-bit sample units
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s).powi(2)).sum();
    #[allow(clippy::cast_possible_truncation)]
    let level = (sum_squares / samples.len() as f64).sqrt() as f32;
    level
}

/// Convert a float sample in [-1.0, 1.0] to 16-bit PCM
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode 16-bit mono samples as WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let writer = hound::WavWriter::new(&mut cursor, wav_spec(sample_rate))
        .map_err(|e| Error::Audio(e.to_string()))?;
    write_samples(writer, samples)?;

    Ok(cursor.into_inner())
}

/// Write 16-bit mono samples to a WAV file
///
/// # Errors
///
/// Returns error if the file cannot be created or written
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let writer = hound::WavWriter::create(path, wav_spec(sample_rate))
        .map_err(|e| Error::Audio(format!("{}: {e}", path.display())))?;
    write_samples(writer, samples)
}

const fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn write_samples<W>(mut writer: hound::WavWriter<W>, samples: &[i16]) -> Result<()>
where
    W: std::io::Write + std::io::Seek,
{
    for &sample in samples {
        writer
            .write_sample(sample)
            .map_err(|e| Error::Audio(e.to_string()))?;
    }
    writer.finalize().map_err(|e| Error::Audio(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_levels() {
        assert!(rms(&[0; 480]) < f32::EPSILON);
        assert!((rms(&[1000; 480]) - 1000.0).abs() < 0.5);
        assert!((rms(&[1000, -1000]) - 1000.0).abs() < 0.5);
        assert!(rms(&[]) < f32::EPSILON);
    }

    #[test]
    fn float_conversion_clamps() {
        assert_eq!(to_i16(0.0), 0);
        assert_eq!(to_i16(1.0), 32767);
        assert_eq!(to_i16(-2.0), -32768);
    }

    #[test]
    fn wav_header() {
        let wav = samples_to_wav(&[0, 100, -100], 16000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 6);
    }
}
