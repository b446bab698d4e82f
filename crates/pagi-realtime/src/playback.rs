//! Gapless playback of inbound assistant audio, with barge-in.
//!
//! Every decoded chunk is scheduled at `max(cursor, now)` on the output clock and
//! the cursor moves to the end of that segment, so chunks that arrive in bursts
//! or late still play back-to-back without overlap. `interrupt()` stops all
//! active sources and rewinds the cursor to zero.

use crate::codec::decode_chunk;
use crate::error::{RealtimeError, RealtimeResult};
use rodio::source::{EmptyCallback, Source};
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::collections::{HashMap, HashSet};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Identifies one scheduled playback unit.
pub type SourceId = u64;

/// Invoked by the output when a source finishes on its own.
pub type EndedCallback = Box<dyn Fn() + Send>;

/// Decoded mono samples ready for playback.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// An open audio output with its own clock.
pub trait AudioOutput: Send {
    /// Current position of the output clock, in seconds.
    fn now(&self) -> f64;

    /// Play `buffer` as source `id`, starting at `start_at` (output clock seconds).
    fn schedule(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> RealtimeResult<()>;

    /// Stop one source immediately. Unknown ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Release the device.
    fn close(&mut self);
}

/// Opens audio outputs; one per session.
pub trait AudioOutputDevice: Send + Sync {
    fn open(&self) -> RealtimeResult<Box<dyn AudioOutput>>;
}

/// Decode → schedule → play, tracking in-flight sources.
pub struct AudioPlaybackScheduler {
    sample_rate: u32,
    output: Option<Box<dyn AudioOutput>>,
    active: Arc<Mutex<HashSet<SourceId>>>,
    cursor: f64,
    next_id: SourceId,
}

impl AudioPlaybackScheduler {
    /// `sample_rate` is the rate of inbound PCM chunks (default 24000).
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            output: None,
            active: Arc::new(Mutex::new(HashSet::new())),
            cursor: 0.0,
            next_id: 0,
        }
    }

    /// Take ownership of a freshly opened output. Any previous one is torn down.
    pub fn attach(&mut self, output: Box<dyn AudioOutput>) {
        self.teardown();
        self.output = Some(output);
    }

    /// Decode and schedule one inbound chunk.
    pub fn enqueue(&mut self, chunk: &str) -> RealtimeResult<SourceId> {
        let samples = decode_chunk(chunk)?;
        self.schedule(PlaybackBuffer {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    /// Schedule an already decoded buffer right after the previous one.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> RealtimeResult<SourceId> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| RealtimeError::Playback("No audio output attached".to_string()))?;

        let duration = buffer.duration();
        let start_at = self.cursor.max(output.now());

        let id = self.next_id;
        self.next_id += 1;

        // Track before handing off so a fast completion cannot be lost.
        self.active.lock().unwrap_or_else(|e| e.into_inner()).insert(id);
        let active = Arc::clone(&self.active);
        let scheduled = output.schedule(
            id,
            buffer,
            start_at,
            Box::new(move || {
                active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            }),
        );
        if let Err(e) = scheduled {
            self.active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(e);
        }

        self.cursor = start_at + duration;
        debug!("🔊 Scheduled source {} at {:.3}s for {:.3}s", id, start_at, duration);
        Ok(id)
    }

    /// Barge-in: stop and discard all active sources, rewind the cursor.
    pub fn interrupt(&mut self) {
        let ids: Vec<SourceId> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        if let Some(output) = self.output.as_mut() {
            for id in &ids {
                output.stop(*id);
            }
        }
        self.cursor = 0.0;
        if !ids.is_empty() {
            info!("⏹️ Playback interrupted ({} source(s) stopped)", ids.len());
        }
    }

    /// Interrupt and release the output. Idempotent.
    pub fn teardown(&mut self) {
        self.interrupt();
        if let Some(mut output) = self.output.take() {
            output.close();
            info!("🔇 Audio output released");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_attached(&self) -> bool {
        self.output.is_some()
    }
}

impl Drop for AudioPlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Default output device via Rodio.
#[derive(Debug, Default)]
pub struct RodioSpeaker;

impl RodioSpeaker {
    pub fn new() -> Self {
        Self
    }
}

impl AudioOutputDevice for RodioSpeaker {
    fn open(&self) -> RealtimeResult<Box<dyn AudioOutput>> {
        info!("🔊 Initializing audio playback");

        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        // OutputStream is !Send; keep it alive on its own thread.
        let thread = thread::Builder::new()
            .name("pagi-realtime-speaker".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    if handle_tx.send(Ok(handle)).is_err() {
                        return;
                    }
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = handle_tx.send(Err(RealtimeError::Playback(e.to_string())));
                }
            })?;

        let handle = handle_rx
            .recv()
            .map_err(|_| RealtimeError::Playback("Output thread exited during setup".to_string()))??;

        info!("✅ Audio playback initialized");
        Ok(Box::new(RodioOutput {
            handle,
            sinks: HashMap::new(),
            opened_at: Instant::now(),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }))
    }
}

/// One rodio `Sink` per scheduled source so each can be stopped on its own.
struct RodioOutput {
    handle: OutputStreamHandle,
    sinks: HashMap<SourceId, Sink>,
    opened_at: Instant,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AudioOutput for RodioOutput {
    fn now(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(
        &mut self,
        id: SourceId,
        buffer: PlaybackBuffer,
        start_at: f64,
        on_ended: EndedCallback,
    ) -> RealtimeResult<()> {
        if self.shutdown.is_none() {
            return Err(RealtimeError::Playback("Audio output closed".to_string()));
        }
        self.sinks.retain(|_, sink| !sink.empty());

        let sink = Sink::try_new(&self.handle).map_err(|e| RealtimeError::Playback(e.to_string()))?;
        let delay = Duration::from_secs_f64((start_at - self.now()).max(0.0));
        let source = rodio::buffer::SamplesBuffer::new(1, buffer.sample_rate, buffer.samples).delay(delay);
        sink.append(source);
        sink.append(EmptyCallback::<f32>::new(on_ended));

        self.sinks.insert(id, sink);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        if let Some(sink) = self.sinks.remove(&id) {
            sink.stop();
        }
    }

    fn close(&mut self) {
        for (_, sink) in self.sinks.drain() {
            sink.stop();
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio output thread panicked");
            }
        }
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.close();
    }
}
