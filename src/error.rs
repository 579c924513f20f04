//! # Error Handling
//!
//! Error taxonomy for the voice session bridge. Every failure that can cross the
//! session or dispatcher boundary is one of these variants, so callers can decide
//! whether to surface it as a status line, an error line, or a structured tool result.
//!
//! ## Error Categories:
//! - **Transport**: the backend connection failed or closed unexpectedly (session becomes Closed)
//! - **Protocol**: a frame from the backend could not be understood
//! - **Decode**: one inbound audio frame was malformed (the session stays Open)
//! - **Capture**: the microphone could not be acquired
//! - **NotReady / SessionClosed**: lifecycle misuse (opening without audio taps, sending on a dead session)
//! - **Config / Internal**: configuration problems and everything else

use std::fmt;

/// Why a microphone could not be acquired.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// The platform refused access to the input device.
    PermissionDenied(String),
    /// No input device (or input file) is available.
    Unavailable(String),
    /// The input exists but is not 16-bit/float PCM at the expected rate.
    UnsupportedFormat(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::PermissionDenied(msg) => write!(f, "Microphone permission denied: {}", msg),
            CaptureError::Unavailable(msg) => write!(f, "Microphone unavailable: {}", msg),
            CaptureError::UnsupportedFormat(msg) => write!(f, "Unsupported input format: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Errors produced by the session bridge.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AssistantError::Decode("odd byte count".to_string()));
/// ```
#[derive(Debug)]
pub enum AssistantError {
    /// Configuration file or environment variable problems
    Config(String),

    /// Connection refused, dropped, or failed mid-stream
    Transport(String),

    /// A backend frame that does not match the expected protocol
    Protocol(String),

    /// Malformed inbound audio payload
    Decode(String),

    /// Microphone acquisition failure
    Capture(CaptureError),

    /// Tried to open a session before the playback graph exists
    NotReady(String),

    /// The session task has already stopped
    SessionClosed,

    /// Anything else
    Internal(String),
}

impl fmt::Display for AssistantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssistantError::Config(msg) => write!(f, "Configuration error: {}", msg),
            AssistantError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AssistantError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AssistantError::Decode(msg) => write!(f, "Decode error: {}", msg),
            AssistantError::Capture(err) => write!(f, "{}", err),
            AssistantError::NotReady(msg) => write!(f, "Not ready: {}", msg),
            AssistantError::SessionClosed => write!(f, "Session is closed"),
            AssistantError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AssistantError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AssistantError::Capture(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CaptureError> for AssistantError {
    fn from(err: CaptureError) -> Self {
        AssistantError::Capture(err)
    }
}

impl From<anyhow::Error> for AssistantError {
    fn from(err: anyhow::Error) -> Self {
        AssistantError::Internal(err.to_string())
    }
}

/// JSON problems only ever come from backend frames, so they are protocol errors.
impl From<serde_json::Error> for AssistantError {
    fn from(err: serde_json::Error) -> Self {
        AssistantError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for AssistantError {
    fn from(err: base64::DecodeError) -> Self {
        AssistantError::Decode(format!("invalid base64 audio: {}", err))
    }
}

impl From<config::ConfigError> for AssistantError {
    fn from(err: config::ConfigError) -> Self {
        AssistantError::Config(err.to_string())
    }
}

impl From<std::io::Error> for AssistantError {
    fn from(err: std::io::Error) -> Self {
        AssistantError::Internal(format!("I/O error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AssistantError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AssistantError::Transport(err.to_string())
    }
}

/// Shorthand for results that use [`AssistantError`].
pub type AppResult<T> = Result<T, AssistantError>;
