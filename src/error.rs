//! Error types for the live session and its audio components.

/// Session-level failures.
///
/// Payloads are rendered strings so the error can be cloned into
/// [`SessionEvent::Error`](crate::events::SessionEvent::Error).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Transport open/close failure. Fatal to the current session.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The remote closed before acknowledging the setup frame.
    #[error("Setup rejected: {0}")]
    SetupRejected(String),

    /// A received frame was not the JSON we expected. Never fatal.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// `connect()` called while a connection is live or in progress.
    #[error("Session already connected")]
    AlreadyConnected,
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::ConnectionError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Microphone acquisition and read failures.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The input device could not be opened (no device, permission denied).
    #[error("Capture unavailable: {0}")]
    Unavailable(String),

    #[error("Capture stream error: {0}")]
    Stream(String),
}

/// Output device failures.
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    /// The output device is closed or could not be opened.
    #[error("Playback unavailable: {0}")]
    Unavailable(String),

    #[error("Playback write error: {0}")]
    Write(String),
}

/// Conversion failures in [`codec`](crate::codec).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM16 buffer has odd length {0}")]
    OddLength(usize),
}
