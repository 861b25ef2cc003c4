//! Audio playback to speakers

use std::f32::consts::TAU;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Rate used for locally generated tones
pub const TONE_SAMPLE_RATE: u32 = 24000;

/// Blocking audio sink
pub trait AudioOutput {
    /// Play a WAV or MP3 file, returning once it has finished
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be decoded or played
    fn play_file(&mut self, path: &Path) -> Result<()>;

    /// Play mono float samples, returning once they have finished
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    fn play_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<()>;
}

/// Plays audio to the default output device
#[derive(Debug, Default)]
pub struct AudioPlayback;

impl AudioPlayback {
    /// Create a playback sink, checking that an output device exists
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );
        Ok(Self)
    }
}

impl AudioOutput for AudioPlayback {
    fn play_file(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read(path)?;
        let (samples, sample_rate) = decode_audio(&data)?;
        tracing::debug!(path = %path.display(), sample_rate, samples = samples.len(), "playing file");
        self.play_samples(&samples, sample_rate)
    }

    fn play_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device".to_string()))?;

        let (config, samples) = output_config(&device, samples, sample_rate)?;
        let channels = usize::from(config.channels).max(1);
        let rate = config.sample_rate.0;
        let total = samples.len();

        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let source = Arc::clone(&samples);
        let cursor = Arc::clone(&position);
        let done = Arc::clone(&finished);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = cursor.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = source.get(pos).copied().unwrap_or(0.0);
                        frame.fill(sample);
                        if pos < source.len() {
                            pos += 1;
                        } else {
                            done.store(true, Ordering::Relaxed);
                        }
                    }
                    cursor.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (total as u64 * 1000) / u64::from(rate.max(1));
        let timeout = Duration::from_millis(duration_ms + 500);
        let start = Instant::now();

        while !finished.load(Ordering::Relaxed) {
            if start.elapsed() > timeout {
                tracing::warn!(?timeout, "playback did not drain in time");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));

        drop(stream);
        tracing::debug!(samples = total, rate, "playback complete");
        Ok(())
    }
}

/// Pick an output config, resampling when the device cannot run at `sample_rate`
fn output_config(
    device: &cpal::Device,
    samples: &[f32],
    sample_rate: u32,
) -> Result<(StreamConfig, Vec<f32>)> {
    let rate = SampleRate(sample_rate);
    let native = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .min_by_key(cpal::SupportedStreamConfigRange::channels);

    if let Some(range) = native {
        return Ok((range.with_sample_rate(rate).config(), samples.to_vec()));
    }

    let fallback: StreamConfig = device
        .default_output_config()
        .map_err(|e| Error::Audio(format!("no suitable output config found: {e}")))?
        .into();
    tracing::debug!(from = sample_rate, to = fallback.sample_rate.0, "resampling for output device");
    let resampled = resample(samples, sample_rate, fallback.sample_rate.0)?;
    Ok((fallback, resampled))
}

/// Resample mono audio using rubato
///
/// The tail is zero-padded to a whole chunk and the filter delay is trimmed,
/// so the output lines up with the input and has `len * to / from` samples.
///
/// # Errors
///
/// Returns error if the resampler rejects the rates
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler = FftFixedIn::<f64>::new(from as usize, to as usize, chunk_size, sub_chunks, 1)
        .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * f64::from(to) / f64::from(from)).round() as usize;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output: Vec<f64> = Vec::with_capacity(expected + delay);
    let mut chunks = input.chunks(chunk_size);

    while output.len() < delay + expected {
        let mut chunk = chunks.next().map_or_else(Vec::new, <[f64]>::to_vec);
        chunk.resize(chunk_size, 0.0);
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    Ok(output
        .into_iter()
        .skip(delay)
        .take(expected)
        .map(|s| s as f32)
        .collect())
}

/// Decode WAV or MP3 bytes to mono f32 samples and their rate
///
/// # Errors
///
/// Returns error if the data is neither a readable WAV nor MP3 stream
pub fn decode_audio(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

#[allow(clippy::cast_precision_loss)]
fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(Cursor::new(data)).map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels).max(1);

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?
        }
    };

    Ok((downmix(&interleaved, channels), spec.sample_rate))
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0_u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(TONE_SAMPLE_RATE);
                let data: Vec<f32> = frame.data.iter().map(|&s| f32::from(s) / 32768.0).collect();
                samples.extend(downmix(&data, frame.channels.max(1)));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if sample_rate == 0 {
        return Err(Error::Audio("MP3 stream contained no frames".to_string()));
    }
    Ok((samples, sample_rate))
}

/// Average interleaved channels down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect()
}

/// A sine tone with short linear ramps at both ends
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn tone(frequency: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let len = usize::try_from(duration.as_nanos() * u128::from(sample_rate) / 1_000_000_000)
        .unwrap_or(0);
    let ramp = (sample_rate as usize / 100).min(len / 2).max(1);

    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let edge = i.min(len - 1 - i);
            let envelope = (edge as f32 / ramp as f32).min(1.0);
            (TAU * frequency * t).sin() * amplitude * envelope
        })
        .collect()
}

/// Short rising cue played when the wake word fires
#[must_use]
pub fn ack_cue(sample_rate: u32) -> Vec<f32> {
    tone(880.0, Duration::from_millis(150), sample_rate, 0.4)
}

/// Two-tone chime used when no spoken fallback can be synthesized
#[must_use]
pub fn fallback_chime(sample_rate: u32) -> Vec<f32> {
    let mut samples = tone(660.0, Duration::from_millis(180), sample_rate, 0.4);
    samples.extend(std::iter::repeat_n(0.0, sample_rate as usize / 20));
    samples.extend(tone(440.0, Duration::from_millis(260), sample_rate, 0.4));
    samples
}
