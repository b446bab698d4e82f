//! Session controller: owns the lifecycle of one realtime voice session.
//!
//! ```text
//! Idle → Connecting → Active ⇄ Reconnecting → Failed
//!   ↑                   │
//!   └──── Closed ←── stop()
//! ```
//!
//! All inbound events for a connection are handled by one task, in order,
//! under the session lock. Every background step carries the generation it
//! was started for; `stop()` bumps the generation so late completions are
//! discarded.

use crate::capture::{AudioCapturePipeline, CpalMicrophone, Microphone, MicrophoneHandle};
use crate::config::RealtimeConfig;
use crate::error::{ErrorClass, RealtimeError, RealtimeResult};
use crate::live::LiveTransport;
use crate::log::{ConversationLog, JsonlConversationLog};
use crate::lookup::PropertyLookup;
use crate::playback::{AudioOutput, AudioOutputDevice, AudioPlaybackScheduler, RodioSpeaker};
use crate::retry::{fixed_schedule, RetryPolicy};
use crate::status::{self, StatusObserver, TracingStatus};
use crate::tools::{AppState, SharedAppState, ToolCallDispatcher};
use crate::transport::{Connection, EventStream, InboundEvent, Transport, TransportEvent};
use crate::turn::TurnAggregator;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closed,
    Failed,
}

impl SessionState {
    /// A start is already underway or the session is live.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Active | SessionState::Reconnecting
        )
    }
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub microphone: Arc<dyn Microphone>,
    pub speaker: Arc<dyn AudioOutputDevice>,
    pub lookup: Arc<dyn PropertyLookup>,
    pub log: Arc<dyn ConversationLog>,
    pub status: Arc<dyn StatusObserver>,
}

impl Collaborators {
    /// Live backend, default audio devices, JSONL log at `config.log_path`.
    pub fn local(config: &RealtimeConfig, lookup: Arc<dyn PropertyLookup>) -> Self {
        Self {
            transport: Arc::new(LiveTransport::new(config.setup_timeout)),
            microphone: Arc::new(CpalMicrophone::new()),
            speaker: Arc::new(RodioSpeaker::new()),
            lookup,
            log: Arc::new(JsonlConversationLog::new(config.log_path.clone())),
            status: Arc::new(TracingStatus),
        }
    }
}

struct Session {
    state: SessionState,
    connection: Option<Arc<dyn Connection>>,
    reconnect_attempts: u32,
    cancel: CancellationToken,
    generation: u64,
}

struct Inner {
    config: RealtimeConfig,
    collab: Collaborators,
    session: Mutex<Session>,
    turns: Mutex<TurnAggregator>,
    playback: Mutex<AudioPlaybackScheduler>,
    capture: Mutex<AudioCapturePipeline>,
    dispatcher: Arc<ToolCallDispatcher>,
    app_state: SharedAppState,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Microphone denial gets one retry; everything else keeps its usual class.
fn microphone_class(err: &RealtimeError) -> ErrorClass {
    match err {
        RealtimeError::Permission(_) => ErrorClass::Transient,
        other => other.class(),
    }
}

fn failure_status(err: &RealtimeError) -> &'static str {
    match err {
        RealtimeError::Auth(_) => status::STATUS_AUTH_FAILED,
        RealtimeError::Quota(_) => status::STATUS_QUOTA_EXCEEDED,
        RealtimeError::Permission(_) => status::STATUS_MIC_DENIED,
        _ => status::STATUS_FAILED,
    }
}

/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(config: RealtimeConfig, collab: Collaborators) -> Self {
        let app_state: SharedAppState = Arc::new(Mutex::new(AppState::default()));
        let dispatcher = Arc::new(ToolCallDispatcher::new(
            Arc::clone(&collab.lookup),
            Arc::clone(&app_state),
            config.tool_cooldown,
        ));
        let inner = Inner {
            turns: Mutex::new(TurnAggregator::new(Arc::clone(&collab.log))),
            playback: Mutex::new(AudioPlaybackScheduler::new(config.output_sample_rate)),
            capture: Mutex::new(AudioCapturePipeline::new(config.capture_config())),
            session: Mutex::new(Session {
                state: SessionState::Idle,
                connection: None,
                reconnect_attempts: 0,
                cancel: CancellationToken::new(),
                generation: 0,
            }),
            dispatcher,
            app_state,
            config,
            collab,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Acquire the microphone, open the output and connect.
    ///
    /// No-op while connecting or live. Returns `Ok` when the session went live
    /// or was stopped during startup; otherwise the session is `Failed` and
    /// the error is returned.
    pub async fn start(&self) -> RealtimeResult<()> {
        let (generation, cancel) = {
            let mut s = lock(&self.inner.session);
            if s.state.is_busy() {
                debug!("Start ignored: session is {:?}", s.state);
                return Ok(());
            }
            s.generation += 1;
            s.cancel = CancellationToken::new();
            s.state = SessionState::Connecting;
            s.reconnect_attempts = 0;
            (s.generation, s.cancel.clone())
        };
        info!("🎙️ Starting voice session (generation {})", generation);

        match self.inner.establish(generation, &cancel, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => {
                debug!("Start abandoned: session stopped");
                Ok(())
            }
            Err(e) => {
                self.inner.fail(generation, &e);
                Err(e)
            }
        }
    }

    /// End the session. Safe from any state; never fails.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop and forget everything shown during the visit.
    pub fn exit(&self) {
        self.inner.stop();
        lock(&self.inner.app_state).reset();
        info!("👋 Voice surface exited");
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.session).state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.session).reconnect_attempts
    }

    pub fn app_state(&self) -> SharedAppState {
        Arc::clone(&self.inner.app_state)
    }

    pub fn dispatcher(&self) -> &Arc<ToolCallDispatcher> {
        &self.inner.dispatcher
    }

    /// Sources currently scheduled or playing.
    pub fn playback_active_count(&self) -> usize {
        lock(&self.inner.playback).active_count()
    }

    pub fn playback_cursor(&self) -> f64 {
        lock(&self.inner.playback).cursor()
    }

    pub fn turn_open(&self) -> bool {
        lock(&self.inner.turns).is_open()
    }

    pub fn frames_sent(&self) -> u64 {
        lock(&self.inner.capture).frames_sent()
    }
}

impl Inner {
    fn status(&self, text: &str) {
        self.collab.status.on_status(text);
    }

    /// Microphone → output → connection → activate.
    async fn establish(
        self: &Arc<Self>,
        generation: u64,
        cancel: &CancellationToken,
        initial: bool,
    ) -> RealtimeResult<()> {
        if initial {
            self.status(status::STATUS_MIC_REQUEST);
        }
        let capture_config = self.config.capture_config();
        let mic_policy = RetryPolicy::new(2)
            .with_classifier(microphone_class)
            .with_schedule(fixed_schedule(&self.config.backoff));
        let mut handle = mic_policy
            .run(cancel, |_| {
                let microphone = Arc::clone(&self.collab.microphone);
                let config = capture_config.clone();
                async move { microphone.acquire(&config).await }
            })
            .await?;

        {
            let s = lock(&self.session);
            if s.generation != generation {
                drop(s);
                handle.release();
                return Err(RealtimeError::Cancelled);
            }
            lock(&self.capture).attach(handle);
        }

        let speaker = Arc::clone(&self.collab.speaker);
        let mut output = tokio::task::spawn_blocking(move || speaker.open())
            .await
            .map_err(|e| RealtimeError::Playback(format!("Output setup task failed: {}", e)))??;
        {
            let s = lock(&self.session);
            if s.generation != generation {
                drop(s);
                output.close();
                return Err(RealtimeError::Cancelled);
            }
            lock(&self.playback).attach(output);
        }

        let options = self.config.connect_options()?;
        let connect_policy = if initial {
            self.config.connect_policy()
        } else {
            RetryPolicy::once()
        };
        let max = connect_policy.max_attempts();
        let (connection, events) = connect_policy
            .run(cancel, |attempt| {
                if initial {
                    if attempt == 1 {
                        self.status(status::STATUS_CONNECTING);
                    } else {
                        self.status(&status::connecting_attempt(attempt, max));
                    }
                }
                let transport = Arc::clone(&self.collab.transport);
                let options = options.clone();
                async move { transport.open(&options).await }
            })
            .await?;

        self.activate(generation, connection, events)
    }

    /// Install a freshly opened connection and start its event loop.
    fn activate(
        self: &Arc<Self>,
        generation: u64,
        connection: Arc<dyn Connection>,
        events: EventStream,
    ) -> RealtimeResult<()> {
        {
            let mut s = lock(&self.session);
            if s.generation != generation || s.cancel.is_cancelled() {
                drop(s);
                connection.close();
                return Err(RealtimeError::Cancelled);
            }
            if let Err(e) = lock(&self.capture).start(Arc::downgrade(&connection)) {
                drop(s);
                connection.close();
                return Err(e);
            }
            s.connection = Some(connection);
            s.state = SessionState::Active;
            s.reconnect_attempts = 0;
        }
        info!("✅ Session live (generation {})", generation);
        self.status(status::STATUS_LISTENING);
        tokio::spawn(Arc::clone(self).event_loop(generation, events));
        Ok(())
    }

    /// Ordered consumer of one connection's events.
    fn event_loop(self: Arc<Self>, generation: u64, mut events: EventStream) -> BoxFuture<'static, ()> {
        async move {
            let cancel = lock(&self.session).cancel.clone();
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(TransportEvent::Open) => debug!("Transport reported open"),
                    Some(TransportEvent::Message(message)) => {
                        if !self.handle_inbound(generation, message) {
                            break;
                        }
                    }
                    Some(TransportEvent::Error(e)) => {
                        self.connection_lost(generation, e).await;
                        break;
                    }
                    Some(TransportEvent::Closed) | None => {
                        self.connection_lost(
                            generation,
                            RealtimeError::Network("connection closed by server".to_string()),
                        )
                        .await;
                        break;
                    }
                }
            }
            debug!("Event loop for generation {} finished", generation);
        }
        .boxed()
    }

    /// Apply one inbound event. Returns false once the event is stale.
    fn handle_inbound(&self, generation: u64, message: InboundEvent) -> bool {
        let s = lock(&self.session);
        if s.generation != generation || s.state != SessionState::Active {
            return false;
        }

        match message {
            InboundEvent::Audio(chunk) => {
                if let Err(e) = lock(&self.playback).enqueue(&chunk) {
                    warn!("Dropping audio chunk: {}", e);
                }
            }
            InboundEvent::InputTranscript(text) => lock(&self.turns).append_input(&text),
            InboundEvent::OutputTranscript(text) => lock(&self.turns).append_output(&text),
            InboundEvent::TurnComplete => {
                lock(&self.turns).complete();
            }
            InboundEvent::Interrupted => {
                lock(&self.playback).interrupt();
                lock(&self.turns).interrupt();
            }
            InboundEvent::ToolCall(invocations) => {
                let Some(connection) = s.connection.as_ref() else {
                    return true;
                };
                for invocation in invocations {
                    let name = invocation.name.clone();
                    if self.dispatcher.submit(invocation, Arc::downgrade(connection), s.cancel.clone()) {
                        lock(&self.turns).note_tool(&name);
                    }
                }
            }
        }
        true
    }

    async fn connection_lost(self: &Arc<Self>, generation: u64, err: RealtimeError) {
        let cancel = {
            let mut s = lock(&self.session);
            if s.generation != generation || s.state != SessionState::Active {
                return;
            }
            s.state = SessionState::Reconnecting;
            s.cancel.clone()
        };
        warn!("📡 Connection lost: {}", err);

        if err.is_fatal() {
            self.fail(generation, &err);
            return;
        }
        self.reconnect(generation, cancel).await;
    }

    async fn reconnect(self: &Arc<Self>, generation: u64, cancel: CancellationToken) {
        let policy = self.config.reconnect_policy();
        let max = policy.max_attempts();
        let attempt_cancel = cancel.clone();

        let result = policy
            .run(&cancel, |attempt| {
                let this = Arc::clone(self);
                let cancel = attempt_cancel.clone();
                async move {
                    {
                        let mut s = lock(&this.session);
                        if s.generation != generation {
                            return Err(RealtimeError::Cancelled);
                        }
                        s.reconnect_attempts = attempt;
                    }
                    info!("🔁 Reconnect attempt {}/{}", attempt, max);
                    this.status(&status::reconnecting_attempt(attempt, max));
                    this.release_media(generation);
                    this.establish(generation, &cancel, false).await
                }
            })
            .await;

        match result {
            Ok(()) => info!("✅ Reconnected"),
            Err(e) if e.is_cancelled() => debug!("Reconnect abandoned: session stopped"),
            Err(e) => self.fail(generation, &e),
        }
    }

    /// Tear down playback, connection and capture, keeping the open turn.
    fn release_media(&self, generation: u64) {
        let mut s = lock(&self.session);
        if s.generation != generation {
            return;
        }
        lock(&self.playback).teardown();
        if let Some(connection) = s.connection.take() {
            connection.close();
        }
        lock(&self.capture).release();
    }

    /// Unrecoverable error: release everything and report.
    fn fail(&self, generation: u64, err: &RealtimeError) {
        {
            let mut s = lock(&self.session);
            if s.generation != generation {
                return;
            }
            s.cancel.cancel();
            self.dispatcher.reset();
            s.state = SessionState::Failed;
            lock(&self.turns).end_session();
            lock(&self.playback).teardown();
            if let Some(connection) = s.connection.take() {
                connection.close();
            }
            lock(&self.capture).release();
        }
        error!("❌ Session failed: {}", err);
        self.status(failure_status(err));
    }

    fn stop(&self) {
        let previous = {
            let mut s = lock(&self.session);
            s.cancel.cancel();
            s.generation += 1;
            self.dispatcher.reset();
            lock(&self.turns).end_session();
            lock(&self.playback).teardown();
            if let Some(connection) = s.connection.take() {
                connection.close();
            }
            lock(&self.capture).release();
            std::mem::replace(&mut s.state, SessionState::Closed)
        };
        info!("🛑 Session stopped (was {:?})", previous);
        self.status(status::STATUS_IDLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_states_block_start() {
        assert!(SessionState::Connecting.is_busy());
        assert!(SessionState::Active.is_busy());
        assert!(SessionState::Reconnecting.is_busy());
        assert!(!SessionState::Idle.is_busy());
        assert!(!SessionState::Closed.is_busy());
        assert!(!SessionState::Failed.is_busy());
    }

    #[test]
    fn microphone_denial_is_retryable_only_for_the_mic() {
        let denied = RealtimeError::Permission("denied".into());
        assert_eq!(microphone_class(&denied), ErrorClass::Transient);
        assert_eq!(denied.class(), ErrorClass::Fatal);
        assert_eq!(
            microphone_class(&RealtimeError::AudioDevice("none".into())),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn failure_status_names_the_cause() {
        assert_eq!(failure_status(&RealtimeError::Auth("x".into())), status::STATUS_AUTH_FAILED);
        assert_eq!(failure_status(&RealtimeError::Quota("x".into())), status::STATUS_QUOTA_EXCEEDED);
        assert_eq!(failure_status(&RealtimeError::Permission("x".into())), status::STATUS_MIC_DENIED);
        assert_eq!(failure_status(&RealtimeError::Network("x".into())), status::STATUS_FAILED);
    }
}
