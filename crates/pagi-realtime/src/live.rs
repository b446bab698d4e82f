//! WebSocket transport for the Gemini Live bidirectional streaming API.
//!
//! `open` performs the handshake and the `setup` exchange, then splits the
//! socket into a writer task (fed by an unbounded channel, so `Connection`
//! methods stay synchronous) and a reader task that turns server messages into
//! ordered `TransportEvent`s.

use crate::codec::AudioFrame;
use crate::error::{RealtimeError, RealtimeResult};
use crate::transport::{
    Connection, ConnectOptions, EventStream, InboundEvent, ToolInvocation, Transport, TransportEvent,
};
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

/// Opens `LiveConnection`s.
#[derive(Debug, Clone)]
pub struct LiveTransport {
    setup_timeout: Duration,
}

impl LiveTransport {
    pub fn new(setup_timeout: Duration) -> Self {
        Self { setup_timeout }
    }
}

impl Default for LiveTransport {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SETUP_TIMEOUT)
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn open(&self, options: &ConnectOptions) -> RealtimeResult<(Arc<dyn Connection>, EventStream)> {
        info!("🌐 Connecting to {} ({})", options.url, options.model);
        let url = format!("{}?key={}", options.url, options.api_key);
        let (ws, _response) = tokio_tungstenite::connect_async(url).await.map_err(map_ws_error)?;
        let (mut write, mut read) = ws.split();

        write
            .send(Message::Text(setup_message(options).to_string()))
            .await
            .map_err(map_ws_error)?;

        match tokio::time::timeout(self.setup_timeout, wait_for_setup(&mut read)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RealtimeError::Timeout(format!(
                    "no setupComplete within {:?}",
                    self.setup_timeout
                )))
            }
        }
        info!("✅ Live session established");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(TransportEvent::Open);

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Writer stopped: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Writer task exiting");
        });

        tokio::spawn(async move {
            loop {
                let event = match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        forward(&event_tx, &text);
                        continue;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => forward(&event_tx, text),
                            Err(_) => debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => match close_error(frame.as_ref()) {
                        Some(err) => TransportEvent::Error(err),
                        None => TransportEvent::Closed,
                    },
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => TransportEvent::Error(map_ws_error(e)),
                    None => TransportEvent::Closed,
                };
                let _ = event_tx.send(event);
                break;
            }
            debug!("Reader task exiting");
        });

        let connection: Arc<dyn Connection> = Arc::new(LiveConnection {
            outbound: out_tx,
            closed: AtomicBool::new(false),
        });
        Ok((connection, event_rx))
    }
}

fn forward(events: &mpsc::UnboundedSender<TransportEvent>, text: &str) {
    match parse_server_message(text) {
        Ok(parsed) => {
            for event in parsed {
                let _ = events.send(TransportEvent::Message(event));
            }
        }
        Err(e) => warn!("Skipping unparseable server message: {}", e),
    }
}

async fn wait_for_setup<S>(read: &mut S) -> RealtimeResult<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(frame))) => {
                return Err(close_error(frame.as_ref())
                    .unwrap_or_else(|| RealtimeError::Network("closed during setup".to_string())))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(map_ws_error(e)),
            None => return Err(RealtimeError::Network("closed during setup".to_string())),
        };
        let value: Value = serde_json::from_str(&text)?;
        if value.get("setupComplete").is_some() {
            return Ok(());
        }
        debug!("Ignoring pre-setup message");
    }
}

/// Outbound half of a live session.
struct LiveConnection {
    outbound: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
}

impl LiveConnection {
    fn push(&self, value: Value) -> RealtimeResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RealtimeError::Network("connection closed".to_string()));
        }
        self.outbound
            .send(Message::Text(value.to_string()))
            .map_err(|_| RealtimeError::Network("connection writer stopped".to_string()))
    }
}

impl Connection for LiveConnection {
    fn send_audio_frame(&self, frame: AudioFrame) -> RealtimeResult<()> {
        self.push(audio_message(&frame))
    }

    fn send_tool_result(&self, correlation_id: &str, text: &str) -> RealtimeResult<()> {
        self.push(tool_response_message(correlation_id, text))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Message::Close(None));
            info!("🔌 Live connection closed");
        }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// First message of every session.
pub fn setup_message(options: &ConnectOptions) -> Value {
    let mut generation = json!({ "responseModalities": ["AUDIO"] });
    if let Some(voice) = &options.voice {
        generation["speechConfig"] = json!({
            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
        });
    }

    let mut setup = json!({
        "model": options.model,
        "generationConfig": generation,
        "tools": options.tools,
        "inputAudioTranscription": {},
        "outputAudioTranscription": {},
    });
    if let Some(instruction) = &options.system_instruction {
        setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
    }
    json!({ "setup": setup })
}

pub fn audio_message(frame: &AudioFrame) -> Value {
    json!({ "realtimeInput": { "mediaChunks": [frame] } })
}

pub fn tool_response_message(correlation_id: &str, text: &str) -> Value {
    json!({
        "toolResponse": {
            "functionResponses": [{ "id": correlation_id, "response": { "result": text } }]
        }
    })
}

/// Parse one server message into inbound events, in delivery order.
///
/// Within `serverContent` the order is: interruption, input transcript,
/// audio parts, output transcript, turn completion.
pub fn parse_server_message(text: &str) -> RealtimeResult<Vec<InboundEvent>> {
    let value: Value = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if let Some(content) = value.get("serverContent") {
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            events.push(InboundEvent::Interrupted);
        }
        if let Some(t) = transcription_text(content, "inputTranscription") {
            events.push(InboundEvent::InputTranscript(t));
        }
        let parts = content
            .pointer("/modelTurn/parts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            if let Some(data) = part.pointer("/inlineData/data").and_then(Value::as_str) {
                events.push(InboundEvent::Audio(data.to_string()));
            }
        }
        if let Some(t) = transcription_text(content, "outputTranscription") {
            events.push(InboundEvent::OutputTranscript(t));
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(calls) = value.pointer("/toolCall/functionCalls").and_then(Value::as_array) {
        let invocations: Vec<ToolInvocation> = calls
            .iter()
            .filter_map(|call| {
                let name = call.get("name")?.as_str()?;
                let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                Some(ToolInvocation::new(id, name, args))
            })
            .collect();
        if !invocations.is_empty() {
            events.push(InboundEvent::ToolCall(invocations));
        }
    }

    if value.get("goAway").is_some() {
        warn!("⚠️ Server announced it will close the session soon");
    }

    Ok(events)
}

fn transcription_text(content: &Value, key: &str) -> Option<String> {
    content
        .get(key)
        .and_then(|t| t.get("text"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Error carried by a close frame, if the close was not a plain shutdown.
pub fn close_error(frame: Option<&CloseFrame<'_>>) -> Option<RealtimeError> {
    let frame = frame?;
    let code = u16::from(frame.code);
    let reason = frame.reason.to_string();
    match code {
        1008 => Some(RealtimeError::Auth(reason)),
        1011 if reason.to_lowercase().contains("quota") => Some(RealtimeError::Quota(reason)),
        1007 => Some(RealtimeError::MalformedInput(reason)),
        1000 | 1001 | 1005 => None,
        _ => Some(RealtimeError::Network(format!("closed with code {}: {}", code, reason))),
    }
}

/// Map a handshake or socket error to the session taxonomy.
pub fn map_ws_error(err: tungstenite::Error) -> RealtimeError {
    match err {
        tungstenite::Error::Http(response) => http_status_error(response.status().as_u16()),
        tungstenite::Error::Url(e) => RealtimeError::Config(format!("invalid endpoint: {}", e)),
        tungstenite::Error::Io(e) => RealtimeError::Network(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RealtimeError::Network("connection closed".to_string())
        }
        other => RealtimeError::Network(other.to_string()),
    }
}

pub fn http_status_error(status: u16) -> RealtimeError {
    match status {
        401 | 403 => RealtimeError::Auth(format!("HTTP {}", status)),
        429 => RealtimeError::Quota(format!("HTTP {}", status)),
        400 => RealtimeError::MalformedInput(format!("HTTP {}", status)),
        s if s >= 500 => RealtimeError::Network(format!("HTTP {}", s)),
        s => RealtimeError::Unknown(format!("HTTP {}", s)),
    }
}
