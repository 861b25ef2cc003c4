//! Hearth - voice companion for a serial-attached display
//!
//! This library provides the pieces of the Hearth companion:
//! - Voice capture, turn recording and wake-word detection
//! - Dialogue over a speech-to-text / chat / text-to-speech service
//! - A line protocol to the display/motor controller on a serial port
//! - The conversation state machine that ties them together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Hardware                          │
//! │   Microphone  │  Speakers  │  Serial display        │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Conversation orchestrator               │
//! │   Wake Word  │  Recorder  │  Playback  │  Display   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │               Dialogue service                       │
//! │   STT  │  Chat (streamed)  │  TTS                   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod dialogue;
pub mod error;
pub mod orchestrator;
pub mod voice;

pub use config::Config;
pub use error::{CollaboratorError, CollaboratorErrorKind, Error, Result};
pub use orchestrator::{
    ConversationOrchestrator, ConversationSettings, ConversationState, OrchestratorParts,
};
