//! Shared test utilities
//!
//! Scripted stand-ins for the serial device, microphone, speaker, wake
//! detector and dialogue service, so the pipeline runs without hardware.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::Value;

use hearth::device::link::IMAGE_PROBE;
use hearth::device::{
    Backoff, Canvas, DeviceLink, DisplayDriver, LinkPolicy, LinkSettings, PixelFormat, PortOpener,
    Renderer, SerialIo, SharedLink,
};
use hearth::dialogue::{DialogueResult, DialogueSession, ReplyStream};
use hearth::voice::{
    AudioOutput, AudioSource, Detection, MicrophoneFactory, RecorderSettings, VoiceActivity,
    WakeWordDetector, samples_to_wav,
};
use hearth::{CollaboratorError, Error, Result};

pub const RATE: u32 = 16_000;
pub const FRAME_LEN: usize = 480;
pub const FRAME_MS: u64 = 30;

// ---------------------------------------------------------------------------
// Serial device
// ---------------------------------------------------------------------------

/// Everything the fake firmware has seen and how it behaves
#[derive(Debug, Default)]
pub struct DeviceState {
    /// Bytes waiting for the host to read
    pub inbound: VecDeque<u8>,
    /// Bytes written since the last flush
    pending: Vec<u8>,
    /// Method names in the order they arrived
    pub commands: Vec<String>,
    /// Image payloads received (probe stripped)
    pub images: Vec<Vec<u8>>,
    /// Reply line per method; default is `{"result":true}`
    pub replies: Vec<(String, String)>,
    /// Methods that get no reply at all
    pub mute_methods: Vec<String>,
    /// Image attempts to leave unacknowledged before acking again
    pub ignore_images: u32,
    /// Never acknowledge images
    pub silent: bool,
    /// Opens to refuse before accepting
    pub refuse_opens: u32,
    /// Open calls seen
    pub open_calls: u32,
    /// Fail every write with a broken pipe
    pub broken: bool,
    /// Image payload writes to time out before accepting again
    pub stall_payloads: u32,
    /// Driver timeouts set by the host, in order
    pub timeouts: Vec<Duration>,
    /// Handles released by the host
    pub closed: u32,
}

pub type SharedDevice = Arc<Mutex<DeviceState>>;

pub fn device() -> SharedDevice {
    Arc::new(Mutex::new(DeviceState::default()))
}

impl DeviceState {
    fn on_flush(&mut self) {
        let frame = std::mem::take(&mut self.pending);

        if let Some(payload) = frame.strip_prefix(IMAGE_PROBE) {
            self.images.push(payload.to_vec());
            if self.silent {
                return;
            }
            if self.ignore_images > 0 {
                self.ignore_images -= 1;
                return;
            }
            self.inbound.push_back(0x06);
            return;
        }

        for line in frame.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            let Ok(request) = serde_json::from_slice::<Value>(line) else {
                self.inbound.extend(b"{\"error\":\"bad json\"}\n");
                continue;
            };
            let method = request["method"].as_str().unwrap_or_default().to_string();
            self.commands.push(method.clone());

            if self.mute_methods.contains(&method) {
                continue;
            }
            let reply = self
                .replies
                .iter()
                .find(|(m, _)| *m == method)
                .map_or_else(|| "{\"result\":true}".to_string(), |(_, r)| r.clone());
            self.inbound.extend(reply.as_bytes());
            self.inbound.push_back(b'\n');
        }
    }
}

pub struct FakePort(SharedDevice);

impl Drop for FakePort {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.lock() {
            state.closed += 1;
        }
    }
}

impl Read for FakePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.lock().unwrap();
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = state.inbound.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

impl Write for FakePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.lock().unwrap();
        if state.broken {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
        }
        if state.stall_payloads > 0 && state.pending.starts_with(IMAGE_PROBE) {
            state.stall_payloads -= 1;
            // The firmware drops the half-received frame
            state.pending.clear();
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        state.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().on_flush();
        Ok(())
    }
}

impl SerialIo for FakePort {
    fn clear_input(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().inbound.clear();
        Ok(())
    }

    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.0.lock().unwrap().inbound.len())
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.0.lock().unwrap().timeouts.push(timeout);
        Ok(())
    }
}

pub struct FakeOpener(pub SharedDevice);

impl PortOpener for FakeOpener {
    fn open(&self, path: &str, _baud: u32, _timeout: Duration) -> io::Result<Box<dyn SerialIo>> {
        let mut state = self.0.lock().unwrap();
        state.open_calls += 1;
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{path} not present"),
            ));
        }
        Ok(Box::new(FakePort(Arc::clone(&self.0))))
    }
}

pub fn fast_settings() -> LinkSettings {
    LinkSettings {
        baud: 115_200,
        open_timeout: Duration::from_millis(10),
        command_timeout: Duration::from_millis(100),
        retry_delay: Duration::from_millis(20),
    }
}

pub fn fast_policy() -> LinkPolicy {
    LinkPolicy {
        path: "/dev/ttyFAKE0".to_string(),
        open_attempts: 3,
        backoff: Backoff::Fixed(Duration::from_millis(5)),
        image_timeout: Duration::from_millis(60),
        image_retries: 2,
    }
}

pub fn link_to(device: &SharedDevice) -> DeviceLink {
    DeviceLink::new(Box::new(FakeOpener(Arc::clone(device))), fast_settings())
}

pub fn shared_link_to(device: &SharedDevice) -> SharedLink {
    SharedLink::new(link_to(device), fast_policy())
}

pub fn display_on(device: &SharedDevice) -> DisplayDriver {
    let renderer = Renderer::new(
        Canvas {
            width: 16,
            height: 16,
        },
        PixelFormat::Rgb565,
        80,
    )
    .unwrap();
    DisplayDriver::new(shared_link_to(device), renderer)
}

/// Write a solid-colour PNG
pub fn write_png(dir: &Path, name: &str, rgb: [u8; 3]) -> PathBuf {
    let path = dir.join(name);
    image::RgbImage::from_pixel(8, 8, image::Rgb(rgb))
        .save(&path)
        .unwrap();
    path
}

/// Write an animated GIF with `count` frames
pub fn write_gif(dir: &Path, name: &str, count: usize) -> PathBuf {
    use image::codecs::gif::{GifEncoder, Repeat};
    use image::{Delay, Frame, Rgba, RgbaImage};

    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    let mut encoder = GifEncoder::new(file);
    encoder.set_repeat(Repeat::Infinite).unwrap();
    for i in 0..count {
        let shade = u8::try_from(i * 40 % 256).unwrap();
        let img = RgbaImage::from_pixel(8, 8, Rgba([shade, 0, 255 - shade, 255]));
        encoder
            .encode_frame(Frame::from_parts(img, 0, 0, Delay::from_numer_denom_ms(50, 1)))
            .unwrap();
    }
    drop(encoder);
    path
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// One 30 ms frame of a 440 Hz tone
pub fn tone_frame(amplitude: f32) -> Vec<i16> {
    (0..FRAME_LEN)
        .map(|i| {
            let t = i as f32 / RATE as f32;
            let v = amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin();
            (v * f32::from(i16::MAX)) as i16
        })
        .collect()
}

/// Frames of tone covering `ms`
pub fn speech(ms: u64) -> Vec<Vec<i16>> {
    (0..ms / FRAME_MS).map(|_| tone_frame(0.3)).collect()
}

/// Frames of silence covering `ms`
pub fn silence(ms: u64) -> Vec<Vec<i16>> {
    (0..ms / FRAME_MS).map(|_| vec![0; FRAME_LEN]).collect()
}

/// What a scripted source does once its frames run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhausted {
    Silence,
    Fail,
}

pub struct ScriptedSource {
    frames: VecDeque<Vec<i16>>,
    then: Exhausted,
    pub reads: usize,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Vec<i16>>, then: Exhausted) -> Self {
        Self {
            frames: frames.into(),
            then,
            reads: 0,
        }
    }
}

impl AudioSource for ScriptedSource {
    fn sample_rate(&self) -> u32 {
        RATE
    }

    fn frame_len(&self) -> usize {
        FRAME_LEN
    }

    fn read_frame(&mut self) -> Result<Vec<i16>> {
        self.reads += 1;
        match self.frames.pop_front() {
            Some(frame) => Ok(frame),
            None if self.then == Exhausted::Fail => {
                Err(Error::Capture("device disconnected".to_string()))
            }
            None => Ok(vec![0; FRAME_LEN]),
        }
    }
}

/// Hands out scripted sources in order, then silent ones
#[derive(Clone, Default)]
pub struct ScriptedMicrophones {
    scripts: Arc<Mutex<VecDeque<Vec<Vec<i16>>>>>,
    pub opens: Arc<Mutex<u32>>,
    fail_when_done: bool,
}

impl ScriptedMicrophones {
    pub fn with(scripts: Vec<Vec<Vec<i16>>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            opens: Arc::default(),
            fail_when_done: false,
        }
    }

    /// Streams error out once their script runs dry
    pub fn failing(mut self) -> Self {
        self.fail_when_done = true;
        self
    }

    pub fn open_count(&self) -> u32 {
        *self.opens.lock().unwrap()
    }
}

impl MicrophoneFactory for ScriptedMicrophones {
    fn open(&self) -> Result<Box<dyn AudioSource>> {
        *self.opens.lock().unwrap() += 1;
        let frames = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let then = if self.fail_when_done {
            Exhausted::Fail
        } else {
            Exhausted::Silence
        };
        Ok(Box::new(ScriptedSource::new(frames, then)))
    }
}

/// Classifier that always errors
pub struct BrokenVad;

impl VoiceActivity for BrokenVad {
    fn is_speech(&mut self, _frame: &[i16]) -> Result<bool> {
        Err(Error::Audio("unsupported frame".to_string()))
    }
}

pub fn recorder_settings() -> RecorderSettings {
    RecorderSettings {
        sample_rate: RATE,
        frame_len: FRAME_LEN,
        energy_threshold: 500.0,
        start_frames: 3,
        silence: Duration::from_millis(1500),
        initial_silence: Duration::from_secs(3),
        max_duration: Duration::from_secs(30),
        min_duration: Duration::from_millis(300),
    }
}

/// What the speaker was asked to play
#[derive(Debug, Clone, PartialEq)]
pub enum Played {
    File(PathBuf),
    Samples(usize),
}

#[derive(Clone, Default)]
pub struct RecordingOutput {
    pub played: Arc<Mutex<Vec<Played>>>,
}

impl RecordingOutput {
    pub fn files(&self) -> Vec<PathBuf> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| match p {
                Played::File(path) => Some(path.clone()),
                Played::Samples(_) => None,
            })
            .collect()
    }

    pub fn sample_plays(&self) -> usize {
        self.played
            .lock()
            .unwrap()
            .iter()
            .filter(|p| matches!(p, Played::Samples(_)))
            .count()
    }
}

impl AudioOutput for RecordingOutput {
    fn play_file(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::Audio(format!("{} missing", path.display())));
        }
        self.played.lock().unwrap().push(Played::File(path.to_path_buf()));
        Ok(())
    }

    fn play_samples(&mut self, samples: &[f32], _sample_rate: u32) -> Result<()> {
        self.played.lock().unwrap().push(Played::Samples(samples.len()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wake word
// ---------------------------------------------------------------------------

/// Fires on the `after`-th frame, once per reset
pub struct CountingDetector {
    keywords: Vec<String>,
    after: usize,
    seen: usize,
    command: Option<String>,
}

impl CountingDetector {
    pub fn new(after: usize) -> Self {
        Self {
            keywords: vec!["hey hearth".to_string()],
            after,
            seen: 0,
            command: None,
        }
    }

    /// Report `command` as spoken together with the wake phrase
    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }
}

#[async_trait]
impl WakeWordDetector for CountingDetector {
    fn keywords(&self) -> &[String] {
        &self.keywords
    }

    async fn process(&mut self, _frame: &[i16]) -> Result<Detection> {
        self.seen += 1;
        if self.seen == self.after {
            Ok(Detection::fired(0, 1))
        } else {
            Ok(Detection::none())
        }
    }

    fn reset(&mut self) {
        self.seen = 0;
    }

    fn take_command(&mut self) -> Option<String> {
        self.command.take()
    }
}

// ---------------------------------------------------------------------------
// Dialogue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DialogueLog {
    /// Queued transcription results; empty transcript once drained
    pub transcripts: VecDeque<DialogueResult<String>>,
    /// Queued chat replies as chunk lists; "Okay." once drained
    pub replies: VecDeque<DialogueResult<Vec<String>>>,
    /// Fail every synthesis
    pub synth_fails: bool,
    /// Sample counts of every transcribed WAV
    pub transcribed: Vec<usize>,
    pub chats: Vec<String>,
    pub synthesized: Vec<String>,
    pub ended: u32,
}

#[derive(Clone, Default)]
pub struct FakeDialogue {
    pub log: Arc<Mutex<DialogueLog>>,
}

impl FakeDialogue {
    pub fn transcript(&self, text: &str) -> &Self {
        self.log
            .lock()
            .unwrap()
            .transcripts
            .push_back(Ok(text.to_string()));
        self
    }

    pub fn transcript_error(&self, error: CollaboratorError) -> &Self {
        self.log.lock().unwrap().transcripts.push_back(Err(error));
        self
    }

    pub fn reply(&self, chunks: &[&str]) -> &Self {
        self.log
            .lock()
            .unwrap()
            .replies
            .push_back(Ok(chunks.iter().map(ToString::to_string).collect()));
        self
    }

    pub fn reply_error(&self, error: CollaboratorError) -> &Self {
        self.log.lock().unwrap().replies.push_back(Err(error));
        self
    }
}

#[async_trait]
impl DialogueSession for FakeDialogue {
    async fn transcribe(&self, audio: &Path) -> DialogueResult<String> {
        let samples = hound::WavReader::open(audio).map_or(0, |r| r.len() as usize);
        let mut log = self.log.lock().unwrap();
        log.transcribed.push(samples);
        log.transcripts.pop_front().unwrap_or_else(|| Ok(String::new()))
    }

    async fn chat(&self, text: &str) -> DialogueResult<ReplyStream> {
        let mut log = self.log.lock().unwrap();
        log.chats.push(text.to_string());
        let chunks = log
            .replies
            .pop_front()
            .unwrap_or_else(|| Ok(vec!["Okay.".to_string()]))?;
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn synthesize(&self, text: &str, output: &Path) -> DialogueResult<PathBuf> {
        let fails = {
            let mut log = self.log.lock().unwrap();
            log.synthesized.push(text.to_string());
            log.synth_fails
        };
        if fails {
            return Err(CollaboratorError::new(
                hearth::CollaboratorErrorKind::Unavailable,
                "tts down",
            ));
        }

        let path = output.with_extension("wav");
        let wav = samples_to_wav(&[0; 160], RATE).unwrap();
        std::fs::write(&path, wav).unwrap();
        Ok(path)
    }

    async fn end_conversation(&self) {
        self.log.lock().unwrap().ended += 1;
    }
}
