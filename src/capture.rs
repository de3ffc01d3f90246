//! Microphone capture pipeline
//!
//! Reads fixed-size blocks of 16 kHz mono float samples on a dedicated OS
//! thread, converts them to PCM16 and forwards each block to an
//! [`AudioChunkSink`] (normally the live session).

use crate::audio::AudioBackend;
use crate::codec::{f32_to_pcm16, CAPTURE_SAMPLE_RATE};
use crate::error::CaptureError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default block: 4096 samples, about 256 ms at 16 kHz.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Receiver of captured PCM16 blocks.
pub trait AudioChunkSink: Send + Sync + 'static {
    fn send_audio_chunk(&self, pcm16: &[u8]);
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    /// Samples per forwarded block.
    pub block_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

struct RunningCapture {
    stop: Arc<AtomicBool>,
    // Detached on stop; the thread exits after its in-flight block.
    _thread: std::thread::JoinHandle<()>,
}

pub struct CapturePipeline {
    backend: Arc<dyn AudioBackend>,
    config: CaptureConfig,
    running: Option<RunningCapture>,
    blocks_sent: Arc<AtomicU64>,
}

impl CapturePipeline {
    pub fn new(backend: Arc<dyn AudioBackend>, config: CaptureConfig) -> Self {
        Self {
            backend,
            config,
            running: None,
            blocks_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the microphone and start forwarding blocks to `sink`.
    ///
    /// Returns once the device is open, or with
    /// [`CaptureError::Unavailable`] if it could not be acquired.
    pub fn start(&mut self, sink: Arc<dyn AudioChunkSink>) -> Result<(), CaptureError> {
        if self.running.is_some() {
            debug!("Capture already running");
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = sync_channel::<Result<(), CaptureError>>(1);

        let backend = self.backend.clone();
        let block_size = self.config.block_size;
        let thread_stop = stop.clone();
        let blocks_sent = self.blocks_sent.clone();

        // The input stream is opened on the capture thread and never leaves it
        let thread = std::thread::Builder::new()
            .name("livetalk-capture".to_string())
            .spawn(move || {
                let mut input = match backend.open_input(CAPTURE_SAMPLE_RATE, block_size) {
                    Ok(input) => {
                        let _ = ready_tx.send(Ok(()));
                        input
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut block = vec![0f32; block_size];
                while !thread_stop.load(Ordering::Acquire) {
                    if let Err(e) = input.read_block(&mut block) {
                        error!("Microphone read failed, stopping capture: {}", e);
                        break;
                    }
                    if thread_stop.load(Ordering::Acquire) {
                        break;
                    }

                    sink.send_audio_chunk(&f32_to_pcm16(&block));
                    blocks_sent.fetch_add(1, Ordering::Relaxed);
                }

                debug!("Capture thread exiting, input released");
            })
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "Capture started: {} Hz mono, {} samples per block",
                    CAPTURE_SAMPLE_RATE, block_size
                );
                self.running = Some(RunningCapture {
                    stop,
                    _thread: thread,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                error!("{}", e);
                Err(e)
            }
            Err(_) => Err(CaptureError::Unavailable(
                "capture thread exited during open".to_string(),
            )),
        }
    }

    /// Stop forwarding blocks. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::Release);
            info!("Capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Blocks forwarded since this pipeline was created.
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
