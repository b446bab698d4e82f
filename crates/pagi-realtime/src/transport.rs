//! Transport seam: how the session talks to the streaming conversational backend.
//!
//! A `Transport` opens connections; each `Connection` accepts outbound audio and
//! tool results, and its inbound side is an ordered stream of `TransportEvent`s.

use crate::codec::AudioFrame;
use crate::error::{RealtimeError, RealtimeResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A backend-issued request to run a named side effect.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Correlation id echoed back with the result.
    pub id: String,
    pub name: String,
    pub args: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// Typed inbound message from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// base64 PCM16 at the output sample rate.
    Audio(String),
    InputTranscript(String),
    OutputTranscript(String),
    TurnComplete,
    /// Barge-in: the user started speaking over assistant playback.
    Interrupted,
    ToolCall(Vec<ToolInvocation>),
}

/// Everything a connection reports, in arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    Open,
    Message(InboundEvent),
    Error(RealtimeError),
    Closed,
}

pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    /// Function declarations advertised to the backend.
    pub tools: Value,
}

/// A live backend connection.
pub trait Connection: Send + Sync {
    /// Fire-and-forget send of one microphone frame.
    fn send_audio_frame(&self, frame: AudioFrame) -> RealtimeResult<()>;

    /// Return a tool result, correlated by invocation id.
    fn send_tool_result(&self, correlation_id: &str, text: &str) -> RealtimeResult<()>;

    /// Close the connection. Safe to call more than once.
    fn close(&self);
}

/// Opens backend connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, options: &ConnectOptions) -> RealtimeResult<(Arc<dyn Connection>, EventStream)>;
}
