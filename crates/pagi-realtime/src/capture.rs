//! Microphone capture: fixed-size blocks → wire frames → outbound connection.
//!
//! The cpal stream is `!Send` on some platforms, so `CpalMicrophone` owns it on a
//! dedicated thread and hands back a `Send` handle.

use crate::codec::encode_frame;
use crate::error::{RealtimeError, RealtimeResult};
use crate::transport::Connection;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, Weak};
use std::thread;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Samples per frame callback (default: 4096, ~256ms at 16kHz)
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            block_size: 4096,
        }
    }
}

/// Called once per captured block of `block_size` mono samples.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Exclusive hold on the microphone.
pub trait MicrophoneHandle: Send {
    /// Install the frame callback and begin delivering blocks.
    fn start(&mut self, on_frame: FrameCallback) -> RealtimeResult<()>;

    /// Stop delivery and release the device. Idempotent.
    fn release(&mut self);
}

/// Source of microphone handles.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Acquire the microphone. Fails with `RealtimeError::Permission` when denied.
    async fn acquire(&self, config: &CaptureConfig) -> RealtimeResult<Box<dyn MicrophoneHandle>>;
}

/// Mic → encode → send. Owns the microphone handle while running.
pub struct AudioCapturePipeline {
    config: CaptureConfig,
    handle: Option<Box<dyn MicrophoneHandle>>,
    frames_sent: Arc<AtomicU64>,
}

impl AudioCapturePipeline {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            handle: None,
            frames_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take ownership of an acquired microphone. Any previous handle is released.
    pub fn attach(&mut self, handle: Box<dyn MicrophoneHandle>) {
        self.release();
        self.handle = Some(handle);
    }

    /// Start streaming frames into `connection`.
    ///
    /// The connection is held weakly: once the session drops it, frames are
    /// discarded without error.
    pub fn start(&mut self, connection: Weak<dyn Connection>) -> RealtimeResult<()> {
        let handle = self
            .handle
            .as_mut()
            .ok_or_else(|| RealtimeError::AudioDevice("No microphone attached".to_string()))?;

        let sample_rate = self.config.sample_rate;
        let frames_sent = Arc::clone(&self.frames_sent);
        handle.start(Box::new(move |block: &[f32]| {
            let Some(conn) = connection.upgrade() else {
                return;
            };
            let frame = encode_frame(block, sample_rate);
            match conn.send_audio_frame(frame) {
                Ok(()) => {
                    frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => debug!("Dropping audio frame: {}", e),
            }
        }))?;

        info!("🎤 Capture pipeline streaming ({}Hz, {} samples/frame)", sample_rate, self.config.block_size);
        Ok(())
    }

    /// Disconnect and release the microphone. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.release();
            info!("🎤 Microphone released");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        self.release();
    }
}

type SharedCallback = Arc<Mutex<Option<FrameCallback>>>;

/// Default input device via CPAL.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices
    pub fn list_input_devices() -> RealtimeResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self, config: &CaptureConfig) -> RealtimeResult<Box<dyn MicrophoneHandle>> {
        info!("🎤 Acquiring microphone ({}Hz, mono)", config.sample_rate);

        let callback: SharedCallback = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_callback = Arc::clone(&callback);
        let config = config.clone();
        let thread = thread::Builder::new()
            .name("pagi-realtime-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(&config, thread_callback) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                // Park until released; the stream stops when dropped here.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Microphone thread exiting");
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(CpalMicrophoneHandle {
                callback,
                shutdown: Some(shutdown_tx),
                thread: Some(thread),
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RealtimeError::AudioDevice(
                "Microphone thread exited during setup".to_string(),
            )),
        }
    }
}

fn build_input_stream(config: &CaptureConfig, callback: SharedCallback) -> RealtimeResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| RealtimeError::AudioDevice("No input device available".to_string()))?;

    info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let block_size = config.block_size.max(1);
    let mut block = Vec::with_capacity(block_size);

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                block.push(sample);
                if block.len() >= block_size {
                    if let Ok(mut slot) = callback.lock() {
                        if let Some(on_frame) = slot.as_mut() {
                            on_frame(&block);
                        }
                    }
                    block.clear();
                }
            }
        },
        move |err| {
            warn!("Audio input stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    info!("✅ Audio capture started");
    Ok(stream)
}

struct CpalMicrophoneHandle {
    callback: SharedCallback,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl MicrophoneHandle for CpalMicrophoneHandle {
    fn start(&mut self, on_frame: FrameCallback) -> RealtimeResult<()> {
        if self.shutdown.is_none() {
            return Err(RealtimeError::AudioDevice("Microphone already released".to_string()));
        }
        let mut slot = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(on_frame);
        Ok(())
    }

    fn release(&mut self) {
        self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalMicrophoneHandle {
    fn drop(&mut self) {
        self.release();
    }
}
