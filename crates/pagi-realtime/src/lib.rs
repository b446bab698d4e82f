//! # PAGI Realtime - Voice Session Controller
//!
//! Client side of a realtime, bidirectional voice conversation with a
//! streaming backend: microphone frames go up, assistant audio, transcripts
//! and tool calls come down. Speech detection and recognition happen on the
//! backend; this crate keeps the session alive and the local state coherent.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Session Controller                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐    │
//! │  │   Mic In     │ → │   Encoder    │ → │  Live Transport  │    │
//! │  │   (cpal)     │   │ (PCM16/b64)  │   │   (WebSocket)    │    │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘    │
//! │                                                 ↓ events         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐    │
//! │  │  Audio Out   │ ← │  Playback    │ ← │   Event Loop     │    │
//! │  │   (rodio)    │   │  Scheduler   │   │  (ordered, 1/conn)│   │
//! │  └──────────────┘   └──────────────┘   └──────────────────┘    │
//! │                                           ↓            ↓         │
//! │                               ┌──────────────┐ ┌─────────────┐  │
//! │                               │ Tool Dispatch│ │ Turn Log    │  │
//! │                               │ (one at once)│ │ (JSONL)     │  │
//! │                               └──────────────┘ └─────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Connects and reconnects go through [`RetryPolicy`]; every failure ends in a
//! status string and a terminal state.

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod live;
pub mod log;
pub mod lookup;
pub mod playback;
pub mod retry;
pub mod session;
pub mod status;
pub mod tools;
pub mod transport;
pub mod turn;

pub use capture::{AudioCapturePipeline, CaptureConfig, CpalMicrophone, Microphone, MicrophoneHandle};
pub use codec::AudioFrame;
pub use config::RealtimeConfig;
pub use error::{ErrorClass, RealtimeError, RealtimeResult};
pub use live::LiveTransport;
pub use log::{ConversationLog, JsonlConversationLog, LogRecord, MemoryConversationLog, TurnStatus};
pub use lookup::{InMemoryCatalog, Property, PropertyLookup};
pub use playback::{AudioOutput, AudioOutputDevice, AudioPlaybackScheduler, PlaybackBuffer, RodioSpeaker};
pub use retry::{RetryAttempt, RetryPolicy};
pub use session::{Collaborators, SessionController, SessionState};
pub use status::{StatusHistory, StatusObserver, TracingStatus};
pub use tools::{AppState, DispatchStage, GuardState, PropertyHistory, ToolCallDispatcher};
pub use transport::{Connection, ConnectOptions, EventStream, InboundEvent, ToolInvocation, Transport, TransportEvent};
pub use turn::TurnAggregator;
