//! Audio device access
//!
//! The session core talks to devices only through [`AudioBackend`], so it can
//! run against PulseAudio in production and in-memory fakes in tests.
//! [`PulseBackend`] uses PulseAudio's simple API: float32 little-endian mono
//! streams in both directions.

use crate::error::{CaptureError, PlaybackError};
use libpulse_binding::def::BufferAttr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::sync_channel;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Samples per write on the playback thread (20 ms at 24 kHz).
const PLAYOUT_BLOCK_FRAMES: usize = 480;
/// Target server-side buffer for playback, in frames (100 ms at 24 kHz).
const PLAYOUT_TARGET_FRAMES: u32 = 2400;

/// A blocking microphone stream.
///
/// Streams are opened and read on the capture thread and never move between
/// threads, so implementations need not be `Send`.
pub trait InputStream {
    /// Fill `block` with the next samples, blocking until they are available.
    fn read_block(&mut self, block: &mut [f32]) -> Result<(), CaptureError>;
}

/// An output device with its own playback clock.
///
/// Times are seconds on the device clock, which advances only while the
/// device is consuming samples.
pub trait OutputDevice: Send {
    /// Current position of the device clock.
    fn current_time(&self) -> f64;

    /// Queue `samples` to start playing at `start_time`.
    fn schedule(&mut self, samples: Vec<f32>, start_time: f64) -> Result<(), PlaybackError>;

    /// Discard every buffer whose start time has not been reached yet.
    /// A buffer that already started keeps playing to its end.
    fn cancel_pending(&mut self);

    /// Stop output and release the device.
    fn close(&mut self);
}

/// Factory for input streams and output devices.
pub trait AudioBackend: Send + Sync {
    fn open_input(
        &self,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Box<dyn InputStream>, CaptureError>;

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, PlaybackError>;
}

/// PulseAudio backend using the default (or a named) source and sink.
#[derive(Debug, Clone)]
pub struct PulseBackend {
    app_name: String,
    source: Option<String>,
    sink: Option<String>,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            source: None,
            sink: None,
        }
    }

    /// Use a specific PulseAudio source for capture.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Use a specific PulseAudio sink for playback.
    pub fn with_sink(mut self, sink: &str) -> Self {
        self.sink = Some(sink.to_string());
        self
    }
}

impl AudioBackend for PulseBackend {
    fn open_input(
        &self,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Box<dyn InputStream>, CaptureError> {
        let spec = Spec {
            format: Format::F32le,
            channels: 1,
            rate: sample_rate,
        };
        let block_bytes = (block_size * 4) as u32;
        let attr = BufferAttr {
            maxlength: block_bytes * 4,
            tlength: u32::MAX,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: block_bytes,
        };

        let simple = Simple::new(
            None,
            &self.app_name,
            Direction::Record,
            self.source.as_deref(),
            "microphone",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| CaptureError::Unavailable(format!("{:?}", e)))?;

        info!(
            "PulseAudio capture opened at {} Hz, {} samples per block",
            sample_rate, block_size
        );
        Ok(Box::new(PulseInput {
            simple,
            bytes: vec![0u8; block_size * 4],
        }))
    }

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        Ok(Box::new(PulseOutput::open(
            &self.app_name,
            self.sink.clone(),
            sample_rate,
        )?))
    }
}

struct PulseInput {
    simple: Simple,
    bytes: Vec<u8>,
}

impl InputStream for PulseInput {
    fn read_block(&mut self, block: &mut [f32]) -> Result<(), CaptureError> {
        self.bytes.resize(block.len() * 4, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| CaptureError::Stream(format!("{:?}", e)))?;

        for (sample, chunk) in block.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }
}

/// A buffer waiting for (or in the middle of) playout.
#[derive(Debug)]
struct PlayoutEntry {
    start_frame: u64,
    samples: Vec<f32>,
}

impl PlayoutEntry {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Debug, Default)]
struct Playout {
    entries: VecDeque<PlayoutEntry>,
    /// Frames handed to PulseAudio so far; this is the device clock.
    position: u64,
    closed: bool,
}

/// Mix every entry overlapping `[position, position + out.len())` into `out`
/// and drop entries that have fully played.
fn render_block(entries: &mut VecDeque<PlayoutEntry>, position: u64, out: &mut [f32]) {
    out.fill(0.0);
    let block_end = position + out.len() as u64;

    for entry in entries.iter() {
        if entry.start_frame >= block_end || entry.end_frame() <= position {
            continue;
        }
        let from = entry.start_frame.max(position);
        let to = entry.end_frame().min(block_end);
        for frame in from..to {
            out[(frame - position) as usize] += entry.samples[(frame - entry.start_frame) as usize];
        }
    }

    entries.retain(|e| e.end_frame() > block_end);
}

/// Drop entries that have not started by `position`; returns how many.
/// An entry starting exactly at `position` has not played a frame yet.
fn drop_unstarted(entries: &mut VecDeque<PlayoutEntry>, position: u64) -> usize {
    let before = entries.len();
    entries.retain(|e| e.start_frame < position);
    before - entries.len()
}

/// PulseAudio playback stream driven by a dedicated writer thread.
///
/// The thread writes silence whenever nothing is scheduled, so the device
/// clock keeps advancing in real time while the stream is open.
pub struct PulseOutput {
    playout: Arc<Mutex<Playout>>,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PulseOutput {
    fn open(app_name: &str, sink: Option<String>, sample_rate: u32) -> Result<Self, PlaybackError> {
        let playout = Arc::new(Mutex::new(Playout::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = sync_channel::<Result<(), PlaybackError>>(1);

        let app_name = app_name.to_string();
        let thread_playout = playout.clone();
        let thread_shutdown = shutdown.clone();

        // Simple is not Send, so it is created on the thread that writes to it
        let thread = std::thread::Builder::new()
            .name("livetalk-playout".to_string())
            .spawn(move || {
                let spec = Spec {
                    format: Format::F32le,
                    channels: 1,
                    rate: sample_rate,
                };
                let attr = BufferAttr {
                    maxlength: u32::MAX,
                    tlength: PLAYOUT_TARGET_FRAMES * 4,
                    prebuf: u32::MAX,
                    minreq: u32::MAX,
                    fragsize: u32::MAX,
                };
                let simple = match Simple::new(
                    None,
                    &app_name,
                    Direction::Playback,
                    sink.as_deref(),
                    "assistant speech",
                    &spec,
                    None,
                    Some(&attr),
                ) {
                    Ok(simple) => {
                        let _ = ready_tx.send(Ok(()));
                        simple
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(PlaybackError::Unavailable(format!("{:?}", e))));
                        return;
                    }
                };

                run_playout(simple, thread_playout, thread_shutdown);
            })
            .map_err(|e| PlaybackError::Unavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("PulseAudio playback opened at {} Hz", sample_rate);
                Ok(Self {
                    playout,
                    sample_rate,
                    shutdown,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PlaybackError::Unavailable(
                "playback thread exited during open".to_string(),
            )),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Playout> {
        self.playout.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn run_playout(simple: Simple, playout: Arc<Mutex<Playout>>, shutdown: Arc<AtomicBool>) {
    let mut block = vec![0f32; PLAYOUT_BLOCK_FRAMES];
    let mut bytes = Vec::with_capacity(PLAYOUT_BLOCK_FRAMES * 4);

    while !shutdown.load(Ordering::Relaxed) {
        {
            let mut state = playout.lock().unwrap_or_else(|e| e.into_inner());
            let position = state.position;
            render_block(&mut state.entries, position, &mut block);
            state.position += PLAYOUT_BLOCK_FRAMES as u64;
        }

        bytes.clear();
        for sample in &block {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        if let Err(e) = simple.write(&bytes) {
            error!("PulseAudio playback write failed: {}", e);
            let mut state = playout.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
            state.entries.clear();
            break;
        }
    }

    debug!("Playout thread exiting");
}

impl OutputDevice for PulseOutput {
    fn current_time(&self) -> f64 {
        self.lock().position as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, samples: Vec<f32>, start_time: f64) -> Result<(), PlaybackError> {
        let mut state = self.lock();
        if state.closed {
            return Err(PlaybackError::Unavailable("output stream closed".to_string()));
        }

        let requested = (start_time * self.sample_rate as f64).round().max(0.0) as u64;
        let start_frame = requested.max(state.position);
        state.entries.push_back(PlayoutEntry {
            start_frame,
            samples,
        });
        Ok(())
    }

    fn cancel_pending(&mut self) {
        let mut state = self.lock();
        let position = state.position;
        let dropped = drop_unstarted(&mut state.entries, position);
        debug!("Cancelled {} pending playback buffer(s)", dropped);
    }

    fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        {
            let mut state = self.lock();
            state.closed = true;
            state.entries.clear();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}
