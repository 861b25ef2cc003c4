//! Dialogue service boundary
//!
//! The conversation loop consumes three operations: transcribe a recorded
//! turn, chat (a stream of reply chunks), and synthesize speech. The
//! conversation history lives behind this trait and is never touched by the
//! caller.

mod openai;
pub mod sse;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::CollaboratorError;

pub use openai::OpenAiDialogue;

/// Result of a dialogue service call
pub type DialogueResult<T> = std::result::Result<T, CollaboratorError>;

/// Stream of reply text chunks
pub type ReplyStream = BoxStream<'static, DialogueResult<String>>;

/// Speech-to-text, chat and text-to-speech provider
#[async_trait]
pub trait DialogueSession: Send + Sync {
    /// Transcribe a WAV file
    async fn transcribe(&self, audio: &Path) -> DialogueResult<String>;

    /// Send the user's text and stream the reply
    ///
    /// The accumulated reply may contain the end-of-conversation marker.
    async fn chat(&self, text: &str) -> DialogueResult<ReplyStream>;

    /// Synthesize `text` into an audio file at `output`
    async fn synthesize(&self, text: &str, output: &Path) -> DialogueResult<PathBuf>;

    /// Text to speak when a call failed with `error`
    fn fallback_message(&self, error: &CollaboratorError) -> String {
        error.fallback_text().to_string()
    }

    /// Forget the conversation so the next one starts fresh
    async fn end_conversation(&self) {}
}

/// Drain a reply stream into one string
///
/// ```
/// use futures::StreamExt;
/// use hearth::dialogue::{ReplyStream, collect_reply};
///
/// # tokio_test::block_on(async {
/// let chunks: ReplyStream =
///     futures::stream::iter(vec![Ok("Hel".to_string()), Ok("lo".to_string())]).boxed();
/// assert_eq!(collect_reply(chunks).await.unwrap(), "Hello");
/// # });
/// ```
///
/// # Errors
///
/// Returns the first error the stream yields
pub async fn collect_reply(mut stream: ReplyStream) -> DialogueResult<String> {
    let mut reply = String::new();
    while let Some(chunk) = stream.next().await {
        reply.push_str(&chunk?);
    }
    Ok(reply)
}

/// Remove every occurrence of `marker` from a reply
///
/// Returns the cleaned text and whether the marker was present.
#[must_use]
pub fn strip_end_marker(reply: &str, marker: &str) -> (String, bool) {
    if marker.is_empty() || !reply.contains(marker) {
        return (reply.trim().to_string(), false);
    }

    let cleaned = reply
        .split(marker)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (cleaned, true)
}
