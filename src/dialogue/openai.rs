//! OpenAI-compatible dialogue service
//!
//! Whisper-style transcription (multipart upload), streamed chat completions
//! (SSE) and `/audio/speech` synthesis against one base URL.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use super::sse::SseParser;
use super::{DialogueResult, DialogueSession, ReplyStream};
use crate::config::DialogueConfig;
use crate::error::{CollaboratorError, CollaboratorErrorKind};
use crate::Result;

/// Audio container requested from the speech endpoint
const SPEECH_FORMAT: &str = "mp3";

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    role: &'static str,
    content: String,
}

impl ChatMessage {
    fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }

    fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant",
            content: content.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

type History = Arc<Mutex<Vec<ChatMessage>>>;

/// Dialogue session backed by an OpenAI-compatible HTTP API
pub struct OpenAiDialogue {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    stt_model: String,
    chat_model: String,
    tts_model: String,
    tts_voice: String,
    system_prompt: String,
    history: History,
}

impl std::fmt::Debug for OpenAiDialogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiDialogue")
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .finish_non_exhaustive()
    }
}

impl OpenAiDialogue {
    /// Create a session; the model is told to end with `end_marker`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &DialogueConfig, end_marker: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        if config.api_key.is_none() {
            tracing::warn!("no dialogue API key configured, requests will be unauthenticated");
        }

        let mut system_prompt = if config.system_prompt.trim().is_empty() {
            "You are Hearth, a friendly voice companion. Keep replies short and conversational; \
             they are spoken aloud."
                .to_string()
        } else {
            config.system_prompt.clone()
        };
        if !end_marker.is_empty() {
            system_prompt.push_str(&format!(
                "\n\nWhen the user says goodbye or clearly wants to stop talking, \
                 end your reply with {end_marker}."
            ));
        }

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            stt_model: config.stt_model.clone(),
            chat_model: config.chat_model.clone(),
            tts_model: config.tts_model.clone(),
            tts_voice: config.tts_voice.clone(),
            system_prompt,
            history: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn post(&self, endpoint: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(format!("{}/{endpoint}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl DialogueSession for OpenAiDialogue {
    async fn transcribe(&self, audio: &Path) -> DialogueResult<String> {
        let bytes = tokio::fs::read(audio).await.map_err(|e| {
            CollaboratorError::new(
                CollaboratorErrorKind::Other,
                format!("cannot read {}: {e}", audio.display()),
            )
        })?;
        tracing::debug!(audio_bytes = bytes.len(), "starting transcription");

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.stt_model.clone());

        let response = self.post("audio/transcriptions").multipart(form).send().await?;
        let response = check_status(response).await?;
        let result: TranscriptionResponse = response.json().await?;

        tracing::info!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }

    async fn chat(&self, text: &str) -> DialogueResult<ReplyStream> {
        let messages = {
            let mut history = self.history.lock().await;
            if history.is_empty() {
                history.push(ChatMessage::system(self.system_prompt.clone()));
            }
            history.push(ChatMessage::user(text));
            history.clone()
        };

        let request = ChatRequest {
            model: &self.chat_model,
            messages: &messages,
            stream: true,
        };
        tracing::debug!(model = %self.chat_model, turns = messages.len(), "sending chat request");

        let response = self.post("chat/completions").json(&request).send().await?;
        let response = check_status(response).await?;

        Ok(reply_stream(response.bytes_stream(), Arc::clone(&self.history)))
    }

    async fn synthesize(&self, text: &str, output: &Path) -> DialogueResult<PathBuf> {
        let request = SpeechRequest {
            model: &self.tts_model,
            input: text,
            voice: &self.tts_voice,
            response_format: SPEECH_FORMAT,
        };

        let response = self.post("audio/speech").json(&request).send().await?;
        let response = check_status(response).await?;
        let audio = response.bytes().await?;

        let path = output.with_extension(SPEECH_FORMAT);
        tokio::fs::write(&path, &audio).await.map_err(|e| {
            CollaboratorError::new(
                CollaboratorErrorKind::Other,
                format!("cannot write {}: {e}", path.display()),
            )
        })?;

        tracing::debug!(bytes = audio.len(), path = %path.display(), "speech synthesized");
        Ok(path)
    }

    async fn end_conversation(&self) {
        self.history.lock().await.clear();
    }
}

/// Turn non-2xx responses into classified errors
async fn check_status(response: reqwest::Response) -> DialogueResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    tracing::error!(status = %status, body = %body, "dialogue API error");
    Err(CollaboratorError::from_status(status.as_u16(), &body))
}

struct ReplyState<S> {
    bytes: std::pin::Pin<Box<S>>,
    parser: SseParser,
    pending: VecDeque<DialogueResult<String>>,
    reply: String,
    history: History,
    done: bool,
}

impl<S> ReplyState<S> {
    fn handle(&mut self, data: &str) {
        match parse_delta(data) {
            Ok(Some(text)) => {
                self.reply.push_str(&text);
                self.pending.push_back(Ok(text));
            }
            Ok(None) => {}
            Err(e) => {
                self.pending.push_back(Err(e));
                self.done = true;
            }
        }
    }

    /// Record the finished reply in the conversation history
    async fn finish(&mut self) {
        self.done = true;
        let reply = std::mem::take(&mut self.reply);
        if !reply.is_empty() {
            self.history.lock().await.push(ChatMessage::assistant(reply));
        }
    }
}

/// Adapt an SSE byte stream into reply text chunks
fn reply_stream<S, B, E>(bytes: S, history: History) -> ReplyStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Into<CollaboratorError> + Send,
{
    let state = ReplyState {
        bytes: Box::pin(bytes),
        parser: SseParser::new(),
        pending: VecDeque::new(),
        reply: String::new(),
        history,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for event in state.parser.push(chunk.as_ref()) {
                        if state.done {
                            break;
                        }
                        if event.is_done() {
                            state.finish().await;
                        } else {
                            state.handle(&event.data);
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    if let Some(event) = state.parser.flush().filter(|e| !e.is_done()) {
                        state.handle(&event.data);
                    }
                    if !state.done {
                        state.finish().await;
                    }
                }
            }
        }
    })
    .boxed()
}

/// Extract the text delta from one streamed completion chunk
fn parse_delta(data: &str) -> DialogueResult<Option<String>> {
    let chunk: Value = serde_json::from_str(data).map_err(|e| {
        CollaboratorError::new(
            CollaboratorErrorKind::InvalidResponse,
            format!("bad stream chunk: {e}"),
        )
    })?;

    if let Some(error) = chunk.get("error").filter(|e| !e.is_null()) {
        return Err(stream_error(error));
    }

    Ok(chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.pointer("/delta/content"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string))
}

/// Classify an error object delivered inside the stream
fn stream_error(error: &Value) -> CollaboratorError {
    let code = error
        .get("code")
        .or_else(|| error.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("stream error")
        .to_string();

    let kind = match code {
        "insufficient_quota" => CollaboratorErrorKind::Quota,
        "rate_limit_exceeded" => CollaboratorErrorKind::RateLimit,
        "server_error" => CollaboratorErrorKind::Unavailable,
        _ => CollaboratorErrorKind::Other,
    };
    CollaboratorError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(chunks: &[&str]) -> Vec<std::result::Result<Vec<u8>, CollaboratorError>> {
        chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect()
    }

    #[test]
    fn parses_delta_content() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"index":0}]}"#;
        assert_eq!(parse_delta(data).unwrap().as_deref(), Some("Hello"));

        let empty = r#"{"choices":[{"delta":{},"finish_reason":"stop","index":0}]}"#;
        assert_eq!(parse_delta(empty).unwrap(), None);
    }

    #[test]
    fn stream_errors_are_classified() {
        let data = r#"{"error":{"code":"insufficient_quota","message":"You exceeded your quota"}}"#;
        assert_eq!(parse_delta(data).unwrap_err().kind, CollaboratorErrorKind::Quota);
        assert_eq!(
            parse_delta("not json").unwrap_err().kind,
            CollaboratorErrorKind::InvalidResponse
        );
    }

    #[tokio::test]
    async fn streams_chunks_and_records_history() {
        let history: History = Arc::new(Mutex::new(Vec::new()));
        let bytes = stream::iter(sse(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"there\"}}]}\n\ndata: [DONE]\n\n",
        ]));

        let chunks: Vec<String> = reply_stream(bytes, Arc::clone(&history))
            .map(|c| c.unwrap())
            .collect()
            .await;

        assert_eq!(chunks, vec!["Hi ".to_string(), "there".to_string()]);
        assert_eq!(
            history.lock().await.as_slice(),
            &[ChatMessage::assistant("Hi there")]
        );
    }

    #[tokio::test]
    async fn stream_without_done_still_finishes() {
        let history: History = Arc::new(Mutex::new(Vec::new()));
        let bytes = stream::iter(sse(&["data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}"]));

        let chunks: Vec<_> = reply_stream(bytes, Arc::clone(&history)).collect().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(history.lock().await.len(), 1);
    }

    #[test]
    fn system_prompt_mentions_marker() {
        let dialogue = OpenAiDialogue::new(&DialogueConfig::default(), "[END]").unwrap();
        assert!(dialogue.system_prompt.ends_with("[END]."));
        assert_eq!(dialogue.base_url, "https://api.openai.com/v1");
    }
}
