//! Turn recorder - saves model speech and transcripts to the filesystem
//!
//! Layout under the recording root:
//!
//! ```text
//! session_<unix secs>/
//!     transcript.txt
//!     turn_001/model.wav
//!     turn_002/model.wav
//! ```

use crate::codec::PLAYBACK_SAMPLE_RATE;
use crate::events::SessionEvent;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

pub struct TurnRecorder {
    enabled: bool,
    base: PathBuf,
    turn: u64,
    cur_audio: Option<WavWriter<BufWriter<File>>>,
}

impl TurnRecorder {
    /// Record into a fresh session directory under `root`, or do nothing
    /// when `root` is `None`.
    pub fn new(root: Option<&Path>) -> Self {
        let Some(root) = root else {
            return Self::disabled();
        };

        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let base = root.join(format!("session_{}", secs));

        let enabled = match fs::create_dir_all(&base) {
            Ok(()) => {
                info!("Recording enabled, saving to: {:?}", base);
                true
            }
            Err(e) => {
                error!("Failed to create recordings directory: {}", e);
                false
            }
        };

        Self {
            enabled,
            base,
            turn: 1,
            cur_audio: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            base: PathBuf::new(),
            turn: 1,
            cur_audio: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Session directory, meaningful only when enabled.
    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn on_event(&mut self, event: &SessionEvent) {
        if !self.enabled {
            return;
        }

        match event {
            SessionEvent::Audio(pcm16) => self.write_audio(pcm16),
            SessionEvent::Message(message) => {
                let line = format!("[{}] {}\n", message.role.as_str(), message.content);
                if let Err(e) = self.append_transcript(&line) {
                    error!("Failed to write transcript: {}", e);
                }
            }
            SessionEvent::TurnComplete => {
                self.close_turn();
                self.turn += 1;
            }
            SessionEvent::Disconnected => self.close_turn(),
            _ => {}
        }
    }

    /// Finalize any open WAV file.
    pub fn finish(&mut self) {
        self.close_turn();
    }

    fn write_audio(&mut self, pcm16: &[u8]) {
        if self.cur_audio.is_none() {
            let dir = self.base.join(format!("turn_{:03}", self.turn));
            if let Err(e) = fs::create_dir_all(&dir) {
                error!("Failed to create turn directory: {}", e);
                return;
            }

            let spec = WavSpec {
                channels: 1,
                sample_rate: PLAYBACK_SAMPLE_RATE,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            };
            match WavWriter::create(dir.join("model.wav"), spec) {
                Ok(writer) => {
                    debug!("Starting recording for turn {} in {:?}", self.turn, dir);
                    self.cur_audio = Some(writer);
                }
                Err(e) => {
                    error!("Failed to create audio file: {}", e);
                    return;
                }
            }
        }

        if let Some(writer) = self.cur_audio.as_mut() {
            for sample in pcm16.chunks_exact(2) {
                if let Err(e) = writer.write_sample(i16::from_le_bytes([sample[0], sample[1]])) {
                    error!("Failed to write audio chunk: {}", e);
                    break;
                }
            }
        }
    }

    fn close_turn(&mut self) {
        if let Some(writer) = self.cur_audio.take() {
            match writer.finalize() {
                Ok(()) => debug!("Closed audio file for turn {}", self.turn),
                Err(e) => error!("Failed to finalize audio file: {}", e),
            }
        }
    }

    fn append_transcript(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.base.join("transcript.txt"))?;
        file.write_all(line.as_bytes())
    }
}

impl Drop for TurnRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}
