//! Conversation state machine
//!
//! One orchestrator owns every per-session resource: the wake detector, the
//! microphone stream, the recorder, the audio output and the display. Each
//! [`ConversationOrchestrator::step`] runs one state and moves to the next.
//! The shutdown token is checked at every transition; once it fires the
//! machine walks to `Ended` and [`ConversationOrchestrator::run`] releases
//! the hardware.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::runtime::RuntimeFlavor;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::device::{Command, DisplayDriver, LinkState};
use crate::dialogue::{DialogueSession, collect_reply, strip_end_marker};
use crate::error::CollaboratorError;
use crate::voice::{
    AudioOutput, AudioSource, Capture, MicrophoneFactory, TONE_SAMPLE_RATE, TurnRecorder,
    Utterance, WakeWordDetector, ack_cue, fallback_chime,
};
use crate::Result;

/// Pause before retrying a microphone that failed to open
const MIC_RETRY: Duration = Duration::from_secs(1);

/// Where the conversation currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Between conversations
    Idle,
    /// Feeding frames to the wake detector
    Listening,
    /// Capturing the user's turn
    Recording,
    /// Transcribe, chat and synthesize
    Processing,
    /// Playing the reply
    Responding,
    /// Closing the conversation
    Ended,
}

impl ConversationState {
    /// Lowercase name, as announced to the device
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Recording => "recording",
            Self::Processing => "processing",
            Self::Responding => "responding",
            Self::Ended => "ended",
        }
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turn-taking and presentation settings
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    /// Consecutive silent turns that end a conversation
    pub max_silence: u32,
    /// Marker that ends the conversation when present in a reply
    pub end_marker: String,
    /// WAV played on wake (a tone if unset)
    pub ack_sound: Option<PathBuf>,
    /// Logo shown while idle and faded to at the end
    pub idle_image: Option<PathBuf>,
    /// Shown while recording
    pub listening_image: Option<PathBuf>,
    /// Shown while processing
    pub thinking_image: Option<PathBuf>,
    /// Looped while speaking
    pub talking_gif: Option<PathBuf>,
    /// Talking loop cadence
    pub frame_delay: Duration,
    /// Steps of the closing fade
    pub fade_steps: u32,
    /// Send `set_state` on each transition
    pub announce_state: bool,
}

impl ConversationSettings {
    /// Collect the settings the orchestrator needs from `config`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_silence: config.conversation.max_silence,
            end_marker: config.conversation.end_marker.clone(),
            ack_sound: config.audio.ack_sound.clone(),
            idle_image: config.display.idle_image.clone(),
            listening_image: config.display.listening_image.clone(),
            thinking_image: config.display.thinking_image.clone(),
            talking_gif: config.display.talking_gif.clone(),
            frame_delay: config.display.frame_delay,
            fade_steps: config.display.fade_steps,
            announce_state: config.device.announce_state,
        }
    }
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Components the orchestrator drives
pub struct OrchestratorParts {
    /// Wake word / keyword spotter
    pub detector: Box<dyn WakeWordDetector>,
    /// Dialogue service
    pub dialogue: Arc<dyn DialogueSession>,
    /// Opens (and reopens) the microphone
    pub microphones: Box<dyn MicrophoneFactory>,
    /// Turn endpointing
    pub recorder: TurnRecorder,
    /// Speaker
    pub output: Box<dyn AudioOutput>,
    /// Attached display, if any
    pub display: Option<DisplayDriver>,
}

/// Per-conversation bookkeeping, reset when a conversation ends
#[derive(Debug, Default)]
struct Conversation {
    /// Utterances captured so far
    turns: u32,
    /// Consecutive turns with nothing said
    silent_turns: u32,
    utterance: Option<Utterance>,
    /// Text spoken right after the wake phrase
    carried: Option<String>,
    reply_audio: Option<PathBuf>,
    /// Reply carried the end marker
    ending: bool,
}

/// Drives the wake → record → respond loop
pub struct ConversationOrchestrator {
    state: ConversationState,
    detector: Box<dyn WakeWordDetector>,
    dialogue: Arc<dyn DialogueSession>,
    microphones: Box<dyn MicrophoneFactory>,
    source: Option<Box<dyn AudioSource>>,
    recorder: TurnRecorder,
    output: Box<dyn AudioOutput>,
    display: Option<DisplayDriver>,
    settings: ConversationSettings,
    shutdown: CancellationToken,
    scratch: TempDir,
    conversation: Conversation,
}

impl ConversationOrchestrator {
    /// Assemble an orchestrator in the `Idle` state
    ///
    /// # Errors
    ///
    /// Returns error if the scratch directory for audio files cannot be created
    pub fn new(
        parts: OrchestratorParts,
        settings: ConversationSettings,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("hearth-turns").tempdir()?;

        Ok(Self {
            state: ConversationState::Idle,
            detector: parts.detector,
            dialogue: parts.dialogue,
            microphones: parts.microphones,
            source: None,
            recorder: parts.recorder,
            output: parts.output,
            display: parts.display,
            settings,
            shutdown,
            scratch,
            conversation: Conversation::default(),
        })
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Consecutive silent turns in the current conversation
    #[must_use]
    pub const fn silent_turns(&self) -> u32 {
        self.conversation.silent_turns
    }

    /// Token that stops the loop
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown, then release the hardware
    ///
    /// The returned future is not `Send`: audio devices stay on the task that
    /// opened them. On a multi-threaded runtime the blocking microphone reads,
    /// captures and playback never hold up other tasks, so signal handling and
    /// serial work keep moving during a turn. On a current-thread runtime they
    /// stall everything else until they return.
    ///
    /// # Errors
    ///
    /// Currently infallible; hardware and service failures are handled
    /// inside the loop
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("conversation loop started");
        while self.step().await {}
        self.cleanup().await;
        tracing::info!("conversation loop stopped");
        Ok(())
    }

    /// Execute the current state once
    ///
    /// Returns `false` once shutdown has been carried through `Ended`.
    pub async fn step(&mut self) -> bool {
        let next = match self.state {
            ConversationState::Idle => self.on_idle().await,
            ConversationState::Listening => self.on_listening().await,
            ConversationState::Recording => self.on_recording().await,
            ConversationState::Processing => self.on_processing().await,
            ConversationState::Responding => self.on_responding().await,
            ConversationState::Ended => {
                self.on_ended().await;
                if self.shutdown.is_cancelled() {
                    return false;
                }
                ConversationState::Idle
            }
        };

        self.transition(next).await;
        true
    }

    async fn transition(&mut self, next: ConversationState) {
        let next = if self.shutdown.is_cancelled() && next != ConversationState::Ended {
            tracing::info!(from = %self.state, "shutdown requested");
            ConversationState::Ended
        } else {
            next
        };

        if next != self.state {
            tracing::info!(from = %self.state, to = %next, "state transition");
            self.state = next;
            self.announce(next).await;
        }
    }

    async fn on_idle(&mut self) -> ConversationState {
        self.detector.reset();
        if let Some(idle) = self.settings.idle_image.clone() {
            self.show(&idle, false).await;
        }
        ConversationState::Listening
    }

    async fn on_listening(&mut self) -> ConversationState {
        if !self.ensure_source().await {
            return ConversationState::Listening;
        }
        let Some(source) = self.source.as_mut() else {
            return ConversationState::Listening;
        };

        let frame = match blocking(|| source.read_frame()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "microphone read failed, reopening");
                self.source = None;
                return ConversationState::Listening;
            }
        };

        match self.detector.process(&frame).await {
            Ok(detection) => {
                let Some(index) = detection.keyword else {
                    return ConversationState::Listening;
                };
                let keyword = self.detector.keywords().get(index).cloned().unwrap_or_default();
                tracing::info!(keyword, "wake word detected");

                self.conversation = Conversation {
                    carried: self.detector.take_command(),
                    ..Conversation::default()
                };
                self.play_ack();
                if let Some(source) = self.source.as_mut() {
                    source.clear();
                }
                ConversationState::Recording
            }
            Err(e) => {
                tracing::warn!(error = %e, "wake word detector failed");
                self.detector.reset();
                ConversationState::Listening
            }
        }
    }

    async fn on_recording(&mut self) -> ConversationState {
        if self.conversation.carried.is_some() {
            self.conversation.turns += 1;
            return ConversationState::Processing;
        }

        if !self.require_display().await {
            return ConversationState::Ended;
        }
        if let Some(listening) = self.settings.listening_image.clone() {
            self.show(&listening, true).await;
        }

        if !self.ensure_source().await {
            return ConversationState::Ended;
        }
        let Some(source) = self.source.as_mut() else {
            return ConversationState::Ended;
        };

        let recorder = &mut self.recorder;
        let shutdown = &self.shutdown;
        match blocking(|| recorder.capture(source.as_mut(), shutdown)) {
            Capture::Utterance(utterance) => {
                self.conversation.turns += 1;
                self.conversation.utterance = Some(utterance);
                ConversationState::Processing
            }
            Capture::Nothing if self.conversation.turns == 0 => {
                tracing::info!("nothing heard after wake word, going back to sleep");
                ConversationState::Idle
            }
            Capture::Nothing => self.silent_turn(),
            Capture::StreamFailed(reason) => {
                tracing::warn!(reason, "recording aborted, reopening microphone");
                self.source = None;
                ConversationState::Ended
            }
        }
    }

    async fn on_processing(&mut self) -> ConversationState {
        if let Some(thinking) = self.settings.thinking_image.clone() {
            self.show(&thinking, false).await;
        }

        match self.process_turn().await {
            Ok(next) => next,
            Err(e) => {
                self.recover(&e).await;
                ConversationState::Ended
            }
        }
    }

    /// Transcribe → chat → synthesize for the current turn
    async fn process_turn(&mut self) -> std::result::Result<ConversationState, CollaboratorError> {
        let turn = self.conversation.turns;

        let text = if let Some(text) = self.conversation.carried.take() {
            text
        } else {
            let Some(utterance) = self.conversation.utterance.take() else {
                return Ok(ConversationState::Recording);
            };
            let wav = self.scratch.path().join(format!("turn-{turn}.wav"));
            if let Err(e) = utterance.write_wav(&wav) {
                tracing::warn!(error = %e, "cannot write utterance");
                self.conversation.silent_turns += 1;
                return Ok(ConversationState::Responding);
            }
            let transcript = self.dialogue.transcribe(&wav).await;
            remove_quietly(&wav);
            transcript?
        };

        if text.trim().is_empty() {
            tracing::debug!(turn, "empty transcript");
            self.conversation.silent_turns += 1;
            return Ok(ConversationState::Responding);
        }
        self.conversation.silent_turns = 0;
        tracing::info!(turn, user = %text, "user turn");

        let reply = collect_reply(self.dialogue.chat(&text).await?).await?;
        let (reply, ending) = strip_end_marker(&reply, &self.settings.end_marker);
        self.conversation.ending = ending;
        tracing::info!(turn, reply = %reply, ending, "assistant reply");

        if reply.is_empty() {
            return Ok(if ending {
                ConversationState::Ended
            } else {
                ConversationState::Recording
            });
        }

        let target = self.scratch.path().join(format!("reply-{turn}"));
        let audio = self.dialogue.synthesize(&reply, &target).await?;
        self.conversation.reply_audio = Some(audio);
        Ok(ConversationState::Responding)
    }

    /// Speak a fallback for a failed dialogue call
    async fn recover(&mut self, error: &CollaboratorError) {
        tracing::warn!(kind = ?error.kind, error = %error, "dialogue call failed");
        let message = self.dialogue.fallback_message(error);
        let target = self.scratch.path().join("fallback");

        match self.dialogue.synthesize(&message, &target).await {
            Ok(audio) => {
                let animate = self.require_display().await;
                self.speak(&audio, animate).await;
                remove_quietly(&audio);
            }
            Err(e) => {
                tracing::warn!(error = %e, "fallback synthesis failed, playing chime");
                let chime = fallback_chime(TONE_SAMPLE_RATE);
                let output = &mut self.output;
                if let Err(e) = blocking(|| output.play_samples(&chime, TONE_SAMPLE_RATE)) {
                    tracing::warn!(error = %e, "fallback chime failed");
                }
            }
        }
    }

    async fn on_responding(&mut self) -> ConversationState {
        // Nothing to say after an empty turn
        let Some(audio) = self.conversation.reply_audio.take() else {
            return self.silence_verdict();
        };

        let display_ok = self.require_display().await;
        self.speak(&audio, display_ok).await;
        remove_quietly(&audio);

        if self.conversation.ending {
            tracing::info!("conversation ended by assistant");
            ConversationState::Ended
        } else if !display_ok {
            ConversationState::Ended
        } else {
            ConversationState::Recording
        }
    }

    async fn on_ended(&mut self) {
        self.dialogue.end_conversation().await;
        self.conversation = Conversation::default();

        if self.shutdown.is_cancelled() {
            return;
        }

        let Some(display) = self.display.as_mut() else {
            return;
        };
        display.stop().await;
        if !display.link().ensure_open().await {
            return;
        }

        let shown = match self.settings.idle_image.as_deref() {
            Some(idle) => display.fade_to(idle, self.settings.fade_steps).await,
            None => display.blank().await,
        };
        match shown {
            Ok(true) => {}
            Ok(false) => tracing::debug!("closing visual not acknowledged"),
            Err(e) => tracing::warn!(error = %e, "closing visual failed"),
        }
    }

    /// Release hardware after shutdown
    async fn cleanup(&mut self) {
        tracing::info!("cleaning up devices");
        self.source = None;

        if let Some(display) = self.display.as_mut() {
            display.stop().await;
            if display.link().state() != LinkState::Closed {
                match display.blank().await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!("blank not acknowledged"),
                    Err(e) => tracing::warn!(error = %e, "blank failed"),
                }
            }
            display.link().close().await;
        }
    }

    /// Count a silent turn; ends the conversation at the limit
    fn silent_turn(&mut self) -> ConversationState {
        self.conversation.silent_turns += 1;
        self.silence_verdict()
    }

    fn silence_verdict(&self) -> ConversationState {
        let silent = self.conversation.silent_turns;

        if silent >= self.settings.max_silence {
            tracing::info!(silent, "too many silent turns, ending conversation");
            ConversationState::Ended
        } else {
            tracing::debug!(silent, max = self.settings.max_silence, "silent turn");
            ConversationState::Recording
        }
    }

    /// Reopen the link before a visual the turn depends on
    ///
    /// Without a display there is nothing to gate on.
    async fn require_display(&mut self) -> bool {
        let Some(display) = self.display.as_ref() else {
            return true;
        };
        if display.link().ensure_open().await {
            return true;
        }
        tracing::warn!(state = %self.state, "display link unavailable, aborting conversation");
        false
    }

    /// Show a still; `checked` skips the reopen because the caller just did it
    async fn show(&mut self, image: &Path, checked: bool) {
        let Some(display) = self.display.as_mut() else {
            return;
        };
        if !checked && !display.link().ensure_open().await {
            return;
        }

        match display.show_still(image).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(image = %image.display(), "image not acknowledged"),
            Err(e) => tracing::warn!(image = %image.display(), error = %e, "cannot show image"),
        }
    }

    /// Play `audio` to the end, with the talking loop running alongside
    async fn speak(&mut self, audio: &Path, animate: bool) {
        let animating = match (animate, self.display.as_mut(), self.settings.talking_gif.as_deref()) {
            (true, Some(display), Some(gif)) => {
                match display.play_loop(gif, self.settings.frame_delay).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot start talking animation");
                        false
                    }
                }
            }
            _ => false,
        };

        let output = &mut self.output;
        if let Err(e) = blocking(|| output.play_file(audio)) {
            tracing::warn!(path = %audio.display(), error = %e, "reply playback failed");
        }

        if !animating {
            return;
        }
        let Some(display) = self.display.as_mut() else {
            return;
        };
        if let Some(stats) = display.stop().await {
            tracing::debug!(sent = stats.sent, dropped = stats.dropped, "talking loop done");
        }
    }

    fn play_ack(&mut self) {
        let output = &mut self.output;
        let played = blocking(|| match &self.settings.ack_sound {
            Some(path) => output.play_file(path),
            None => output.play_samples(&ack_cue(TONE_SAMPLE_RATE), TONE_SAMPLE_RATE),
        });
        if let Err(e) = played {
            tracing::warn!(error = %e, "acknowledgment cue failed");
        }
    }

    async fn ensure_source(&mut self) -> bool {
        if self.source.is_some() {
            return true;
        }

        match self.microphones.open() {
            Ok(source) => {
                tracing::debug!(
                    sample_rate = source.sample_rate(),
                    frame_len = source.frame_len(),
                    "microphone opened"
                );
                self.source = Some(source);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot open microphone");
                tokio::select! {
                    () = self.shutdown.cancelled() => {}
                    () = tokio::time::sleep(MIC_RETRY) => {}
                }
                false
            }
        }
    }

    /// Tell the firmware about the new state, if the link is up
    async fn announce(&self, state: ConversationState) {
        if !self.settings.announce_state {
            return;
        }
        let Some(display) = self.display.as_ref() else {
            return;
        };
        let link = display.link();
        if link.state() == LinkState::Closed {
            return;
        }

        let command = Command::with_params("set_state", json!({ "state": state.as_str() }));
        if let Err(e) = link.send_command(command).await {
            tracing::debug!(state = %state, error = %e, "state announcement failed");
        }
    }
}

/// Run blocking hardware work from the conversation task
///
/// On a multi-threaded runtime the worker's queued tasks move to another
/// thread first; on a current-thread runtime `f` simply runs inline.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    let multi_thread = tokio::runtime::Handle::try_current()
        .is_ok_and(|handle| handle.runtime_flavor() == RuntimeFlavor::MultiThread);
    if multi_thread {
        tokio::task::block_in_place(f)
    } else {
        f()
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::trace!(path = %path.display(), error = %e, "cannot remove scratch file");
    }
}

/// Cancel `token` on SIGINT or SIGTERM
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
