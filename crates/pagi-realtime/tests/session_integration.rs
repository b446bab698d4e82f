//! Session lifecycle tests against in-process fakes (no audio hardware, no network).

use async_trait::async_trait;
use pagi_realtime::codec::encode_frame;
use pagi_realtime::playback::{EndedCallback, SourceId};
use pagi_realtime::status::{
    STATUS_AUTH_FAILED, STATUS_CONNECTING, STATUS_FAILED, STATUS_IDLE, STATUS_LISTENING, STATUS_MIC_DENIED,
    STATUS_MIC_REQUEST,
};
use pagi_realtime::{
    AudioFrame, AudioOutput, AudioOutputDevice, CaptureConfig, Collaborators, Connection, ConnectOptions,
    EventStream, InMemoryCatalog, InboundEvent, MemoryConversationLog, Microphone, MicrophoneHandle,
    GuardState, PlaybackBuffer, Property, PropertyLookup, RealtimeConfig, RealtimeError, RealtimeResult, SessionController, SessionState,
    StatusHistory, ToolInvocation, Transport, TransportEvent, TurnStatus,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

// ── Fakes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Succeed,
    Network,
    Auth,
    Hang,
}

#[derive(Default)]
struct FakeConnection {
    frames: AtomicUsize,
    tool_results: Mutex<Vec<(String, String)>>,
    closed: AtomicBool,
}

impl Connection for FakeConnection {
    fn send_audio_frame(&self, _frame: AudioFrame) -> RealtimeResult<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn send_tool_result(&self, correlation_id: &str, text: &str) -> RealtimeResult<()> {
        self.tool_results
            .lock()
            .unwrap()
            .push((correlation_id.to_string(), text.to_string()));
        Ok(())
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeTransport {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    opens: AtomicUsize,
    senders: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeTransport {
    fn new(fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            opens: AtomicUsize::new(0),
            senders: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        })
    }

    fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Push an event into the most recent connection.
    fn emit(&self, event: TransportEvent) {
        let senders = self.senders.lock().unwrap();
        senders.last().expect("no connection opened").send(event).unwrap();
    }

    fn message(&self, event: InboundEvent) {
        self.emit(TransportEvent::Message(event));
    }

    fn last_connection(&self) -> Arc<FakeConnection> {
        Arc::clone(self.connections.lock().unwrap().last().expect("no connection opened"))
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _options: &ConnectOptions) -> RealtimeResult<(Arc<dyn Connection>, EventStream)> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());
        match outcome {
            Outcome::Succeed => {
                let (tx, rx) = mpsc::unbounded_channel();
                tx.send(TransportEvent::Open).unwrap();
                let connection = Arc::new(FakeConnection::default());
                self.senders.lock().unwrap().push(tx);
                self.connections.lock().unwrap().push(Arc::clone(&connection));
                Ok((connection as Arc<dyn Connection>, rx))
            }
            Outcome::Network => Err(RealtimeError::Network("connection refused".into())),
            Outcome::Auth => Err(RealtimeError::Auth("HTTP 401".into())),
            Outcome::Hang => futures::future::pending().await,
        }
    }
}

struct FakeMicHandle {
    live: Arc<AtomicUsize>,
    released: bool,
}

impl MicrophoneHandle for FakeMicHandle {
    fn start(&mut self, _on_frame: pagi_realtime::capture::FrameCallback) -> RealtimeResult<()> {
        Ok(())
    }
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeMicHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
struct FakeMicrophone {
    acquires: AtomicUsize,
    live: Arc<AtomicUsize>,
    deny: AtomicBool,
}

impl FakeMicrophone {
    fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&self, _config: &CaptureConfig) -> RealtimeResult<Box<dyn MicrophoneHandle>> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        if self.deny.load(Ordering::SeqCst) {
            return Err(RealtimeError::Permission("user dismissed the prompt".into()));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMicHandle {
            live: Arc::clone(&self.live),
            released: false,
        }))
    }
}

#[derive(Default)]
struct SpeakerState {
    opens: usize,
    closes: usize,
    stops: usize,
    /// Held so sources stay active until stopped.
    pending: Vec<EndedCallback>,
}

#[derive(Default)]
struct FakeSpeaker(Arc<Mutex<SpeakerState>>);

struct FakeOutput(Arc<Mutex<SpeakerState>>);

impl AudioOutput for FakeOutput {
    fn now(&self) -> f64 {
        0.0
    }
    fn schedule(&mut self, _id: SourceId, _buffer: PlaybackBuffer, _start_at: f64, on_ended: EndedCallback) -> RealtimeResult<()> {
        self.0.lock().unwrap().pending.push(on_ended);
        Ok(())
    }
    fn stop(&mut self, _id: SourceId) {
        self.0.lock().unwrap().stops += 1;
    }
    fn close(&mut self) {
        self.0.lock().unwrap().closes += 1;
    }
}

impl AudioOutputDevice for FakeSpeaker {
    fn open(&self) -> RealtimeResult<Box<dyn AudioOutput>> {
        self.0.lock().unwrap().opens += 1;
        Ok(Box::new(FakeOutput(Arc::clone(&self.0))))
    }
}

/// Holds every search until the gate is opened.
struct GatedLookup {
    gate: Arc<Notify>,
}

#[async_trait]
impl PropertyLookup for GatedLookup {
    async fn search(&self, _query: &str) -> RealtimeResult<Vec<Property>> {
        self.gate.notified().await;
        Ok(vec![riyadh_villa()])
    }
    async fn alternatives(&self, _kind: &str) -> RealtimeResult<Vec<String>> {
        Ok(vec![])
    }
}

// ── Harness ────────────────────────────────────────────────────────────────

struct Harness {
    controller: SessionController,
    transport: Arc<FakeTransport>,
    microphone: Arc<FakeMicrophone>,
    speaker: Arc<Mutex<SpeakerState>>,
    log: Arc<MemoryConversationLog>,
    status: Arc<StatusHistory>,
}

fn riyadh_villa() -> Property {
    Property {
        id: "riyadh-1".into(),
        title: "فيلا حديثة".into(),
        kind: "فيلا".into(),
        location: "الرياض".into(),
        price: 3_100_000,
        bedrooms: Some(5),
        area_sqm: Some(420),
        description: "Corner plot near King Fahd Road.".into(),
    }
}

fn harness(fallback: Outcome) -> Harness {
    harness_with(
        fallback,
        Arc::new(InMemoryCatalog::new(vec![riyadh_villa()])),
        vec![Duration::from_millis(5)],
    )
}

fn harness_with(fallback: Outcome, lookup: Arc<dyn PropertyLookup>, backoff: Vec<Duration>) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let transport = FakeTransport::new(fallback);
    let microphone = Arc::new(FakeMicrophone::default());
    let speaker = FakeSpeaker::default();
    let speaker_state = Arc::clone(&speaker.0);
    let log = Arc::new(MemoryConversationLog::new());
    let status = Arc::new(StatusHistory::new());

    let config = RealtimeConfig {
        api_key: "test-key".into(),
        backoff,
        tool_cooldown: Duration::from_millis(20),
        ..RealtimeConfig::default()
    };
    let collab = Collaborators {
        transport: transport.clone(),
        microphone: microphone.clone(),
        speaker: Arc::new(speaker),
        lookup,
        log: log.clone(),
        status: status.clone(),
    };

    Harness {
        controller: SessionController::new(config, collab),
        transport,
        microphone,
        speaker: speaker_state,
        log,
        status,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// 0.5s of assistant audio at 24kHz.
fn half_second_chunk() -> String {
    encode_frame(&vec![0.2f32; 12_000], 24_000).data
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn start_goes_live_and_reports_status() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();

    assert_eq!(h.controller.state(), SessionState::Active);
    assert_eq!(h.microphone.live(), 1);
    assert_eq!(h.speaker.lock().unwrap().opens, 1);
    assert_eq!(
        h.status.entries(),
        vec![STATUS_MIC_REQUEST, STATUS_CONNECTING, STATUS_LISTENING]
    );
}

#[tokio::test]
async fn second_start_while_active_is_a_no_op() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();
    h.controller.start().await.unwrap();

    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.microphone.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(h.controller.state(), SessionState::Active);
}

#[tokio::test]
async fn transient_connect_failures_are_retried_with_attempt_status() {
    let h = harness(Outcome::Succeed);
    h.transport.script.lock().unwrap().extend([Outcome::Network, Outcome::Network]);

    h.controller.start().await.unwrap();

    assert_eq!(h.transport.opens(), 3);
    assert_eq!(h.controller.state(), SessionState::Active);
    let entries = h.status.entries();
    assert!(entries.contains(&"Connecting (attempt 2/3)...".to_string()));
    assert!(entries.contains(&"Connecting (attempt 3/3)...".to_string()));
}

#[tokio::test]
async fn completed_turn_is_logged_once() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();

    h.transport.message(InboundEvent::InputTranscript("أريد ".into()));
    h.transport.message(InboundEvent::InputTranscript("فيلا".into()));
    h.transport.message(InboundEvent::OutputTranscript("Here is one.".into()));
    h.transport.message(InboundEvent::TurnComplete);

    wait_until(|| h.log.records().len() == 1).await;
    let record = &h.log.records()[0];
    assert_eq!(record.user_text, "أريد فيلا");
    assert_eq!(record.assistant_text, "Here is one.");
    assert_eq!(record.status, TurnStatus::Complete);
    assert!(!h.controller.turn_open());
}

#[tokio::test]
async fn interruption_stops_playback_and_flushes_turn() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();

    h.transport.message(InboundEvent::InputTranscript("كم السعر".into()));
    h.transport.message(InboundEvent::Audio(half_second_chunk()));
    h.transport.message(InboundEvent::Audio(half_second_chunk()));
    wait_until(|| h.controller.playback_active_count() == 2).await;
    assert!((h.controller.playback_cursor() - 1.0).abs() < 1e-9);

    h.transport.message(InboundEvent::Interrupted);
    wait_until(|| h.controller.playback_active_count() == 0).await;
    assert_eq!(h.controller.playback_cursor(), 0.0);
    assert_eq!(h.speaker.lock().unwrap().stops, 2);

    let records = h.log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TurnStatus::Interrupted);
    assert_eq!(records[0].user_text, "كم السعر");

    // Next chunk plays from the current clock, not after the discarded audio.
    h.transport.message(InboundEvent::Audio(half_second_chunk()));
    wait_until(|| h.controller.playback_active_count() == 1).await;
    assert!((h.controller.playback_cursor() - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn tool_call_updates_state_and_answers_backend() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();

    h.transport.message(InboundEvent::InputTranscript("فيلا في الرياض".into()));
    h.transport.message(InboundEvent::ToolCall(vec![ToolInvocation::new(
        "call-1",
        "search_properties",
        json!({ "query": "فيلا في الرياض" }),
    )]));

    let connection = h.transport.last_connection();
    wait_until(|| connection.tool_results.lock().unwrap().len() == 1).await;
    let (id, text) = connection.tool_results.lock().unwrap()[0].clone();
    assert_eq!(id, "call-1");
    assert!(text.contains("King Fahd Road"));

    {
        let state = h.controller.app_state();
        let state = state.lock().unwrap();
        assert_eq!(state.current.as_ref().unwrap().id, "riyadh-1");
        assert_eq!(state.history.len(), 1);
        assert!(state.property_visible);
    }

    h.transport.message(InboundEvent::TurnComplete);
    wait_until(|| h.log.records().len() == 1).await;
    assert_eq!(h.log.records()[0].tools_used, vec!["search_properties"]);
}

#[tokio::test]
async fn reconnect_gives_up_after_three_attempts() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();
    let first = h.transport.last_connection();

    h.transport.set_fallback(Outcome::Network);
    h.transport.emit(TransportEvent::Error(RealtimeError::Network("reset by peer".into())));

    wait_until(|| h.controller.state() == SessionState::Failed).await;
    assert_eq!(h.transport.opens(), 1 + 3);
    assert_eq!(h.controller.reconnect_attempts(), 3);
    assert!(first.closed.load(Ordering::SeqCst));
    assert_eq!(h.microphone.live(), 0);

    let entries = h.status.entries();
    for n in 1..=3 {
        let expected = format!("Connection lost. Reconnecting (attempt {}/3)...", n);
        assert!(entries.contains(&expected), "missing {:?}", expected);
    }

    // No fourth attempt later.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.opens(), 4);
    assert_eq!(h.controller.state(), SessionState::Failed);
}

#[tokio::test]
async fn successful_reconnect_resets_counter_and_keeps_turn() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();
    let first = h.transport.last_connection();

    h.transport.message(InboundEvent::InputTranscript("مرحبا".into()));
    wait_until(|| h.controller.turn_open()).await;

    h.transport.script.lock().unwrap().push_back(Outcome::Network);
    h.transport.emit(TransportEvent::Closed);

    wait_until(|| h.transport.opens() == 3 && h.controller.state() == SessionState::Active).await;
    assert_eq!(h.controller.reconnect_attempts(), 0);
    assert!(first.closed.load(Ordering::SeqCst));
    assert!(h.controller.turn_open());
    assert_eq!(h.microphone.live(), 1);
    assert!(h.log.records().is_empty());

    // The new connection drives the session.
    h.transport.message(InboundEvent::TurnComplete);
    wait_until(|| h.log.records().len() == 1).await;
    assert_eq!(h.log.records()[0].user_text, "مرحبا");
}

#[tokio::test]
async fn auth_failure_fails_without_retry() {
    let h = harness(Outcome::Auth);
    let result = h.controller.start().await;

    assert!(matches!(result, Err(RealtimeError::Auth(_))));
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert_eq!(h.status.last().as_deref(), Some(STATUS_AUTH_FAILED));
    assert_eq!(h.microphone.live(), 0);
}

#[tokio::test]
async fn fatal_error_mid_session_skips_reconnect() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();

    h.transport.emit(TransportEvent::Error(RealtimeError::Auth("key revoked".into())));

    wait_until(|| h.controller.state() == SessionState::Failed).await;
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.controller.reconnect_attempts(), 0);
    assert_eq!(h.status.last().as_deref(), Some(STATUS_AUTH_FAILED));
}

#[tokio::test]
async fn microphone_denial_is_retried_once_then_fails() {
    let h = harness(Outcome::Succeed);
    h.microphone.deny.store(true, Ordering::SeqCst);

    let result = h.controller.start().await;

    assert!(matches!(result, Err(RealtimeError::Permission(_))));
    assert_eq!(h.microphone.acquires.load(Ordering::SeqCst), 2);
    assert_eq!(h.transport.opens(), 0);
    assert_eq!(h.controller.state(), SessionState::Failed);
    assert_eq!(h.status.last().as_deref(), Some(STATUS_MIC_DENIED));
}

#[tokio::test]
async fn stop_flushes_open_turn_once_and_restart_is_clean() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();
    let connection = h.transport.last_connection();

    h.transport.message(InboundEvent::InputTranscript("أبغى شقة".into()));
    h.transport.message(InboundEvent::Audio(half_second_chunk()));
    wait_until(|| h.controller.turn_open() && h.controller.playback_active_count() == 1).await;

    h.controller.stop();

    let records = h.log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, TurnStatus::SessionEnd);
    assert_eq!(records[0].user_text, "أبغى شقة");
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.controller.playback_active_count(), 0);
    assert!(connection.closed.load(Ordering::SeqCst));
    assert_eq!(h.microphone.live(), 0);
    assert_eq!(h.speaker.lock().unwrap().closes, 1);
    assert_eq!(h.status.last().as_deref(), Some(STATUS_IDLE));

    h.controller.stop();
    assert_eq!(h.log.records().len(), 1);

    h.controller.start().await.unwrap();
    assert_eq!(h.controller.state(), SessionState::Active);
    assert!(!h.controller.turn_open());
    h.transport.message(InboundEvent::OutputTranscript("أهلا".into()));
    h.transport.message(InboundEvent::TurnComplete);
    wait_until(|| h.log.records().len() == 2).await;
    assert_eq!(h.log.records()[1].user_text, "");
}

#[tokio::test]
async fn stop_during_connect_abandons_start() {
    let h = harness(Outcome::Hang);
    let controller = h.controller.clone();
    let start = tokio::spawn(async move { controller.start().await });

    wait_until(|| h.transport.opens() == 1).await;
    assert_eq!(h.controller.state(), SessionState::Connecting);
    h.controller.stop();

    let result = start.await.unwrap();
    assert!(result.is_ok());
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.microphone.live(), 0);
    assert_eq!(h.status.last().as_deref(), Some(STATUS_IDLE));
}

#[tokio::test]
async fn events_after_stop_are_ignored() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();
    h.controller.stop();

    // The sender may already be gone with the event loop; either way nothing lands.
    let senders = h.transport.senders.lock().unwrap();
    let _ = senders[0].send(TransportEvent::Message(InboundEvent::InputTranscript("late".into())));
    drop(senders);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(!h.controller.turn_open());
    assert!(h.log.records().is_empty());
}

#[tokio::test]
async fn exit_clears_viewing_history() {
    let h = harness(Outcome::Succeed);
    h.controller.start().await.unwrap();
    h.transport.message(InboundEvent::ToolCall(vec![ToolInvocation::new(
        "call-1",
        "search_properties",
        json!({ "query": "فيلا في الرياض" }),
    )]));
    let app_state = h.controller.app_state();
    wait_until(|| app_state.lock().unwrap().history.len() == 1).await;

    h.controller.stop();
    assert_eq!(app_state.lock().unwrap().history.len(), 1);

    h.controller.exit();
    let state = app_state.lock().unwrap();
    assert!(state.history.is_empty());
    assert!(state.current.is_none());
    assert!(!state.property_visible);
    assert!(!state.lead_form_visible);
}

#[tokio::test]
async fn stop_during_reconnect_backoff_closes_cleanly() {
    let h = harness_with(
        Outcome::Succeed,
        Arc::new(InMemoryCatalog::new(vec![riyadh_villa()])),
        vec![Duration::from_secs(60)],
    );
    h.controller.start().await.unwrap();

    h.transport.set_fallback(Outcome::Network);
    h.transport.emit(TransportEvent::Closed);
    wait_until(|| h.transport.opens() == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.controller.state(), SessionState::Reconnecting);

    h.controller.stop();

    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.microphone.live(), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.transport.opens(), 2);
    assert_eq!(h.controller.state(), SessionState::Closed);
    assert_eq!(h.status.last().as_deref(), Some(STATUS_IDLE));
    assert!(!h.status.entries().contains(&STATUS_FAILED.to_string()));
}

#[tokio::test]
async fn tool_effect_in_flight_at_exit_leaves_no_trace() {
    let gate = Arc::new(Notify::new());
    let h = harness_with(
        Outcome::Succeed,
        Arc::new(GatedLookup { gate: Arc::clone(&gate) }),
        vec![Duration::from_millis(5)],
    );
    h.controller.start().await.unwrap();
    let connection = h.transport.last_connection();

    h.transport.message(InboundEvent::ToolCall(vec![ToolInvocation::new(
        "call-1",
        "search_properties",
        json!({ "query": "فيلا في الرياض" }),
    )]));
    wait_until(|| h.controller.dispatcher().guard_state() == GuardState::Held).await;

    h.controller.exit();
    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let app_state = h.controller.app_state();
    {
        let state = app_state.lock().unwrap();
        assert!(state.history.is_empty());
        assert!(state.current.is_none());
        assert!(!state.property_visible);
    }
    assert!(connection.tool_results.lock().unwrap().is_empty());

    h.controller.start().await.unwrap();
    assert!(app_state.lock().unwrap().history.is_empty());
}

#[tokio::test]
async fn next_session_gets_a_free_tool_guard() {
    let gate = Arc::new(Notify::new());
    let h = harness_with(
        Outcome::Succeed,
        Arc::new(GatedLookup { gate: Arc::clone(&gate) }),
        vec![Duration::from_millis(5)],
    );
    h.controller.start().await.unwrap();

    h.transport.message(InboundEvent::ToolCall(vec![ToolInvocation::new(
        "call-1",
        "search_properties",
        json!({ "query": "فيلا في الرياض" }),
    )]));
    wait_until(|| h.controller.dispatcher().guard_state() == GuardState::Held).await;

    h.controller.stop();
    assert_eq!(h.controller.dispatcher().guard_state(), GuardState::Open);

    h.controller.start().await.unwrap();
    let connection = h.transport.last_connection();
    h.transport.message(InboundEvent::ToolCall(vec![ToolInvocation::new(
        "call-2",
        "show_lead_form",
        json!({}),
    )]));

    wait_until(|| connection.tool_results.lock().unwrap().len() == 1).await;
    assert_eq!(connection.tool_results.lock().unwrap()[0].0, "call-2");
    assert!(h.controller.app_state().lock().unwrap().lead_form_visible);
}
