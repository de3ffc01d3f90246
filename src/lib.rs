//! livetalk - real-time multimodal conversation client
//!
//! Opens a persistent WebSocket session with the Gemini Live API, streams
//! microphone audio and camera stills outward, and reassembles the inbound
//! stream of synthesized speech and transcripts into ordered turns with
//! barge-in support.

#![forbid(unsafe_code)]

/// PulseAudio device backend and the device traits the core runs against
pub mod audio;
/// Microphone capture pipeline
pub mod capture;
/// PCM and base64 conversions
pub mod codec;
/// Session configuration
pub mod config;
/// Error types
pub mod error;
/// Events delivered to the hosting application
pub mod events;
/// Gemini Live wire format
pub mod gemini;
/// Gapless playback scheduling
pub mod playback;
/// On-disk conversation recorder
pub mod recorder;
/// Connection lifecycle and receive dispatch
pub mod session;
/// Per-role transcript buffering
pub mod transcript;
/// JPEG stills for the video channel
pub mod video;

pub use audio::{AudioBackend, InputStream, OutputDevice, PulseBackend};
pub use capture::{AudioChunkSink, CaptureConfig, CapturePipeline};
pub use config::{Modality, SessionConfig};
pub use error::{CaptureError, CodecError, PlaybackError, SessionError};
pub use events::SessionEvent;
pub use playback::PlaybackScheduler;
pub use session::{ConnectionState, Session, SessionHandle};
pub use transcript::{Message, Role, TranscriptAccumulator};
