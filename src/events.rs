//! Events delivered to the hosting application.

use crate::error::SessionError;
use crate::transcript::Message;

/// One notification from a live session, in the order it happened.
///
/// Received on the channel returned by [`Session::new`](crate::Session::new).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Setup was acknowledged; fires once per successful `connect()`.
    Connected,
    /// The session left the connected state (local or remote teardown).
    Disconnected,
    /// A complete transcript message for the turn that just ended.
    Message(Message),
    /// Raw PCM16 speech exactly as received.
    Audio(Vec<u8>),
    /// A session-fatal error.
    Error(SessionError),
    /// The user barged in; queued speech was dropped.
    Interrupted,
    TurnComplete,
    /// The server announced it will close soon.
    GoAway { time_left: Option<String> },
}

/// Events parsed out of a single inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SetupAck,
    AudioPart(Vec<u8>),
    InputTranscriptChunk(String),
    OutputTranscriptChunk(String),
    TurnComplete,
    Interrupted,
    GoAway { time_left: Option<String> },
}
