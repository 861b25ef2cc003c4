//! Voice processing module
//!
//! Handles audio capture, voice activity classification, turn endpointing,
//! wake word detection, and playback. Transcription and synthesis go through
//! the dialogue service (see `dialogue`).

mod capture;
mod playback;
mod recorder;
mod vad;
mod wake_word;

pub use capture::{
    AudioSource, CpalMicrophones, Microphone, MicrophoneFactory, SAMPLE_RATE, rms, samples_to_wav,
    to_i16, write_wav,
};
pub use playback::{
    AudioOutput, AudioPlayback, TONE_SAMPLE_RATE, ack_cue, decode_audio, fallback_chime,
    resample, tone,
};
pub use recorder::{Capture, RecorderSettings, TurnRecorder, Utterance};
pub use vad::{EnergyOnly, VoiceActivity, WebRtcVad};
pub use wake_word::{
    Detection, EnergyWakeDetector, TranscriptWakeDetector, WakeWordDetector, match_wake_word,
};
