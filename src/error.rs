//! Error types for the Hearth companion runtime

use thiserror::Error;

/// Result type alias for Hearth operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the companion runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Serial link could not be opened, written or read
    #[error("transport error: {0}")]
    Transport(String),

    /// Peer reply was missing or malformed on an otherwise open link
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peer answered with an explicit error field
    #[error("remote error: {0}")]
    Remote(String),

    /// Dialogue service failure
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// Microphone stream failure during a recording turn
    #[error("capture error: {0}")]
    Capture(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Display rendering error
    #[error("display error: {0}")]
    Display(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Image decode/encode error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Category of a dialogue service failure
///
/// Drives the fallback message spoken to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorErrorKind {
    /// Account quota or billing limit exhausted
    Quota,
    /// Too many requests, try again later
    RateLimit,
    /// Connection, DNS or timeout failure
    Network,
    /// Service answered with a 5xx status
    Unavailable,
    /// Service answered but the body could not be understood
    InvalidResponse,
    /// Anything else
    Other,
}

impl CollaboratorErrorKind {
    /// User-facing text spoken when a dialogue call fails with this kind
    #[must_use]
    pub const fn fallback_text(self) -> &'static str {
        match self {
            Self::Quota => {
                "I've used up my thinking budget for now. Please ask my owner to check the account."
            }
            Self::RateLimit => "I'm getting a lot of questions right now. Let's talk again in a minute.",
            Self::Network => "I can't reach the internet right now. Please check my connection.",
            Self::Unavailable => "My brain service is having trouble. Let's try again later.",
            Self::InvalidResponse | Self::Other => "Sorry, something went wrong. Let's try again later.",
        }
    }
}

/// Failure reported by a dialogue service call
#[derive(Debug, Clone, Error)]
#[error("dialogue service error ({kind:?}): {message}")]
pub struct CollaboratorError {
    /// Failure category
    pub kind: CollaboratorErrorKind,
    /// Provider detail, for logs only
    pub message: String,
}

impl CollaboratorError {
    /// Create a new collaborator error
    #[must_use]
    pub fn new(kind: CollaboratorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an HTTP failure by status code and response body
    ///
    /// A 429 whose body mentions quota or billing is a quota failure, any other
    /// 429 is a rate limit.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let lower = body.to_lowercase();
        let kind = match status {
            429 if lower.contains("quota") || lower.contains("billing") => {
                CollaboratorErrorKind::Quota
            }
            402 => CollaboratorErrorKind::Quota,
            429 => CollaboratorErrorKind::RateLimit,
            500..=599 => CollaboratorErrorKind::Unavailable,
            _ if lower.contains("insufficient_quota") => CollaboratorErrorKind::Quota,
            _ => CollaboratorErrorKind::Other,
        };
        Self::new(kind, format!("status {status}: {body}"))
    }

    /// User-facing fallback text for this failure
    #[must_use]
    pub const fn fallback_text(&self) -> &'static str {
        self.kind.fallback_text()
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
            CollaboratorErrorKind::Network
        } else if e.is_decode() || e.is_body() {
            CollaboratorErrorKind::InvalidResponse
        } else if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), &e.to_string());
        } else {
            CollaboratorErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}
