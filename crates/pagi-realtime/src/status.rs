//! Human-readable session status sink.

use std::sync::Mutex;
use tracing::info;

pub const STATUS_IDLE: &str = "Tap the microphone to start talking";
pub const STATUS_MIC_REQUEST: &str = "Requesting microphone access...";
pub const STATUS_CONNECTING: &str = "Connecting...";
pub const STATUS_LISTENING: &str = "Listening...";
pub const STATUS_FAILED: &str = "Connection failed. Tap the microphone to try again.";
pub const STATUS_AUTH_FAILED: &str = "Authentication failed. Check the API key and try again.";
pub const STATUS_QUOTA_EXCEEDED: &str = "Usage quota exceeded. Please try again later.";
pub const STATUS_MIC_DENIED: &str = "Microphone access denied. Allow the microphone and try again.";

pub fn connecting_attempt(attempt: u32, max: u32) -> String {
    format!("Connecting (attempt {}/{})...", attempt, max)
}

pub fn reconnecting_attempt(attempt: u32, max: u32) -> String {
    format!("Connection lost. Reconnecting (attempt {}/{})...", attempt, max)
}

/// Receives a status string at every session state transition.
pub trait StatusObserver: Send + Sync {
    fn on_status(&self, status: &str);
}

/// Writes status changes to the tracing log.
#[derive(Debug, Default)]
pub struct TracingStatus;

impl StatusObserver for TracingStatus {
    fn on_status(&self, status: &str) {
        info!("📣 {}", status);
    }
}

/// Remembers every status it was given, in order.
#[derive(Debug, Default)]
pub struct StatusHistory {
    entries: Mutex<Vec<String>>,
}

impl StatusHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }
}

impl StatusObserver for StatusHistory {
    fn on_status(&self, status: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(status.to_string());
    }
}
