//! Error types for the PAGI Realtime session controller

use thiserror::Error;

/// Result type alias for realtime session operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// How the retry layer treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort immediately, no backoff.
    Fatal,
    /// Wait and try again while attempts remain.
    Transient,
    /// Explicit stop during a wait or an in-flight attempt. Not a failure.
    Cancelled,
}

/// Errors that can occur while running a realtime voice session
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Microphone permission denied: {0}")]
    Permission(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Quota exceeded: {0}")]
    Quota(String),

    #[error("Malformed request: {0}")]
    MalformedInput(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Tool effect failed: {0}")]
    ToolEffect(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Audio codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lookup error: {0}")]
    Lookup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RealtimeError {
    /// Default retry classification.
    ///
    /// Unknown and IO failures count as transient; anything that a retry cannot
    /// fix (credentials, quota, bad input, missing hardware) is fatal.
    pub fn class(&self) -> ErrorClass {
        match self {
            RealtimeError::Cancelled => ErrorClass::Cancelled,
            RealtimeError::Permission(_)
            | RealtimeError::Auth(_)
            | RealtimeError::Quota(_)
            | RealtimeError::MalformedInput(_)
            | RealtimeError::AudioDevice(_)
            | RealtimeError::Config(_) => ErrorClass::Fatal,
            RealtimeError::Network(_)
            | RealtimeError::Timeout(_)
            | RealtimeError::ToolEffect(_)
            | RealtimeError::Playback(_)
            | RealtimeError::Codec(_)
            | RealtimeError::Lookup(_)
            | RealtimeError::Io(_)
            | RealtimeError::Json(_)
            | RealtimeError::Unknown(_) => ErrorClass::Transient,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RealtimeError::Cancelled)
    }
}

impl From<cpal::DevicesError> for RealtimeError {
    fn from(err: cpal::DevicesError) -> Self {
        RealtimeError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for RealtimeError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            // Denied capture surfaces as an unavailable device on most hosts.
            cpal::BuildStreamError::DeviceNotAvailable => {
                RealtimeError::Permission(err.to_string())
            }
            other => RealtimeError::AudioDevice(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for RealtimeError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => RealtimeError::Permission(err.to_string()),
            other => RealtimeError::AudioDevice(other.to_string()),
        }
    }
}

impl From<base64::DecodeError> for RealtimeError {
    fn from(err: base64::DecodeError) -> Self {
        RealtimeError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_transient_split() {
        assert_eq!(RealtimeError::Auth("401".into()).class(), ErrorClass::Fatal);
        assert_eq!(RealtimeError::Quota("429".into()).class(), ErrorClass::Fatal);
        assert_eq!(RealtimeError::MalformedInput("bad".into()).class(), ErrorClass::Fatal);
        assert_eq!(RealtimeError::Network("reset".into()).class(), ErrorClass::Transient);
        assert_eq!(RealtimeError::Timeout("setup".into()).class(), ErrorClass::Transient);
        assert_eq!(RealtimeError::Unknown("?".into()).class(), ErrorClass::Transient);
        assert!(RealtimeError::Cancelled.is_cancelled());
        assert!(!RealtimeError::Cancelled.is_fatal());
    }
}
