//! Gapless playback of received speech.
//!
//! Each decoded buffer is scheduled to start exactly where the previous one
//! ends on the output device clock, so network jitter never produces gaps or
//! overlaps. An interruption drops everything that has not started yet.

use crate::audio::{AudioBackend, OutputDevice};
use crate::codec::{duration_secs, pcm16_to_f32};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A buffer handed to the device together with its start time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledBuffer {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub struct PlaybackScheduler {
    backend: Arc<dyn AudioBackend>,
    sample_rate: u32,
    /// Acquired on first enqueue, released by `close()`.
    device: Option<Box<dyn OutputDevice>>,
    /// `None` until the first buffer is scheduled.
    next_play_time: Option<f64>,
    /// Scheduled buffers that may not have started yet.
    pending: VecDeque<ScheduledBuffer>,
    /// Latched on device failure; cleared by `close()`.
    unavailable: bool,
}

impl PlaybackScheduler {
    pub fn new(backend: Arc<dyn AudioBackend>, sample_rate: u32) -> Self {
        Self {
            backend,
            sample_rate,
            device: None,
            next_play_time: None,
            pending: VecDeque::new(),
            unavailable: false,
        }
    }

    /// Decode a PCM16 buffer and schedule it right after the previous one.
    ///
    /// Returns the start time on the device clock, or `None` if the buffer
    /// was dropped (decode failure, device unavailable).
    pub fn enqueue(&mut self, pcm16: &[u8]) -> Option<f64> {
        if self.unavailable {
            debug!("Playback unavailable, dropping {} bytes", pcm16.len());
            return None;
        }

        let samples = match pcm16_to_f32(pcm16) {
            Ok(samples) if !samples.is_empty() => samples,
            Ok(_) => return None,
            Err(e) => {
                warn!("Dropping undecodable playback buffer: {}", e);
                return None;
            }
        };
        let duration = duration_secs(samples.len(), self.sample_rate);

        if self.device.is_none() {
            match self.backend.open_output(self.sample_rate) {
                Ok(device) => {
                    info!("Playback device acquired");
                    self.device = Some(device);
                }
                Err(e) => {
                    error!("{}", e);
                    self.unavailable = true;
                    return None;
                }
            }
        }
        let device = self.device.as_mut()?;

        let now = device.current_time();
        let start_time = match self.next_play_time {
            Some(next) => next.max(now),
            None => now,
        };

        if let Err(e) = device.schedule(samples, start_time) {
            error!("{}", e);
            self.unavailable = true;
            return None;
        }

        self.next_play_time = Some(start_time + duration);
        self.pending.push_back(ScheduledBuffer {
            start_time,
            duration,
        });
        self.prune(now);

        debug!(
            "Scheduled {:.3}s of audio at {:.3} (now {:.3})",
            duration, start_time, now
        );
        Some(start_time)
    }

    /// Drop every buffer that has not started and rewind the cursor to now.
    ///
    /// A buffer that is already playing is left to finish.
    pub fn flush(&mut self) {
        let dropped = self.pending_len();
        self.pending.clear();

        match self.device.as_mut() {
            Some(device) => {
                device.cancel_pending();
                self.next_play_time = Some(device.current_time());
            }
            None => self.next_play_time = None,
        }

        debug!("Playback flushed, {} pending buffer(s) dropped", dropped);
    }

    /// Release the output device. The next enqueue reopens it.
    pub fn close(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
            info!("Playback device released");
        }
        self.pending.clear();
        self.next_play_time = None;
        self.unavailable = false;
    }

    /// Cursor where the next buffer will start, if anything was scheduled.
    pub fn next_play_time(&self) -> Option<f64> {
        self.next_play_time
    }

    /// Number of scheduled buffers whose start time is still in the future.
    pub fn pending_len(&mut self) -> usize {
        if let Some(now) = self.device.as_ref().map(|d| d.current_time()) {
            self.prune(now);
        }
        self.pending.len()
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable
    }

    fn prune(&mut self, now: f64) {
        while self.pending.front().is_some_and(|b| b.start_time <= now) {
            self.pending.pop_front();
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}
