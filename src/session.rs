//! Live session: connection lifecycle, outbound framing and receive dispatch
//!
//! The WebSocket is split into a sink and a stream. A writer task drains an
//! unbounded queue into the sink, so sends never block and go out in call
//! order. A reader task parses every inbound frame and routes the resulting
//! events into the transcript accumulator, the playback scheduler and the
//! host's event channel.
//!
//! All mutable session state sits behind one mutex. Every connection attempt
//! gets a fresh epoch; tasks belonging to an older epoch find a mismatch on
//! their next frame and exit without touching anything.

use crate::audio::{AudioBackend, PulseBackend};
use crate::capture::{AudioChunkSink, CapturePipeline};
use crate::codec::{AUDIO_MIME_TYPE, JPEG_MIME_TYPE, PLAYBACK_SAMPLE_RATE};
use crate::config::SessionConfig;
use crate::error::{CaptureError, Result, SessionError};
use crate::events::{InboundEvent, SessionEvent};
use crate::gemini::{self, ClientMessage};
use crate::playback::PlaybackScheduler;
use crate::transcript::{Role, TranscriptAccumulator};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// The WebSocket open request is in flight.
    Connecting,
    /// Setup frame sent, waiting for `setupComplete`.
    AwaitingSetupAck,
    Active,
}

/// Outcome of [`Shared::abandon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abandon {
    TornDown,
    Superseded,
    AlreadyActive,
}

struct Inner {
    state: ConnectionState,
    epoch: u64,
    transcript: TranscriptAccumulator,
    playback: PlaybackScheduler,
    capture: CapturePipeline,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    pending_ack: Option<oneshot::Sender<Result<()>>>,
    reader: Option<JoinHandle<()>>,
}

impl Inner {
    /// Drop everything tied to the current connection and return the state
    /// we were in. Emits nothing; partial transcripts are discarded.
    fn teardown(&mut self) -> ConnectionState {
        let previous = self.state;
        self.epoch += 1;

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer flushes what is queued, then closes the socket
        self.outbound = None;
        self.capture.stop();
        self.playback.flush();
        self.transcript.reset();
        if let Some(ack) = self.pending_ack.take() {
            let _ = ack.send(Err(SessionError::ConnectionError(
                "disconnected before setup completed".to_string(),
            )));
        }

        self.state = ConnectionState::Disconnected;
        if previous != ConnectionState::Disconnected {
            debug!("Session torn down from {:?}", previous);
        }
        previous
    }
}

/// How the inbound stream ended.
enum StreamEnd {
    /// Close frame or end of stream, with the close reason if any.
    Closed(String),
    Failed(String),
}

struct Shared {
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn new(
        config: &SessionConfig,
        backend: Arc<dyn AudioBackend>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                epoch: 0,
                transcript: TranscriptAccumulator::new(),
                playback: PlaybackScheduler::new(backend.clone(), PLAYBACK_SAMPLE_RATE),
                capture: CapturePipeline::new(backend, config.capture),
                outbound: None,
                pending_ack: None,
                reader: None,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Queue a frame if the session is active; otherwise drop it.
    fn send(&self, message: ClientMessage, what: &str) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize {}: {}", what, e);
                return;
            }
        };

        let inner = self.lock();
        if inner.state != ConnectionState::Active {
            warn!("Dropping {}: session is {:?}", what, inner.state);
            return;
        }
        match &inner.outbound {
            Some(outbound) => {
                if outbound.send(WsMessage::Text(json.into())).is_err() {
                    warn!("Writer task gone, dropping {}", what);
                }
            }
            None => warn!("No outbound queue, dropping {}", what),
        }
    }

    /// Parse one inbound frame and route its events.
    ///
    /// Returns `false` once the frame's connection is no longer current.
    fn dispatch(&self, epoch: u64, text: &str) -> bool {
        let events = match gemini::parse_server_frame(text) {
            Ok(events) => events,
            Err(e) => {
                warn!("{}, dropping frame", e);
                debug!("Raw frame: {}", text);
                return true;
            }
        };

        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }

        for event in events {
            if event == InboundEvent::SetupAck {
                if inner.state != ConnectionState::AwaitingSetupAck {
                    debug!("Ignoring setup acknowledgment in state {:?}", inner.state);
                    continue;
                }
                inner.state = ConnectionState::Active;
                info!("Setup acknowledged, session active");
                if let Some(ack) = inner.pending_ack.take() {
                    let _ = ack.send(Ok(()));
                }
                self.emit(SessionEvent::Connected);
                continue;
            }

            if inner.state != ConnectionState::Active {
                debug!("Ignoring {:?} before setup acknowledgment", event);
                continue;
            }

            match event {
                InboundEvent::AudioPart(pcm16) => {
                    inner.playback.enqueue(&pcm16);
                    self.emit(SessionEvent::Audio(pcm16));
                }
                InboundEvent::InputTranscriptChunk(text) => {
                    inner.transcript.append(Role::User, &text);
                }
                InboundEvent::OutputTranscriptChunk(text) => {
                    inner.transcript.append(Role::Model, &text);
                }
                InboundEvent::TurnComplete => {
                    for message in inner.transcript.flush() {
                        self.emit(SessionEvent::Message(message));
                    }
                    debug!("Turn complete");
                    self.emit(SessionEvent::TurnComplete);
                }
                InboundEvent::Interrupted => {
                    info!("Model output interrupted");
                    inner.playback.flush();
                    self.emit(SessionEvent::Interrupted);
                }
                InboundEvent::GoAway { time_left } => {
                    warn!("Server going away (time left: {:?})", time_left);
                    self.emit(SessionEvent::GoAway { time_left });
                }
                InboundEvent::SetupAck => {}
            }
        }

        true
    }

    /// The inbound stream of connection `epoch` ended.
    fn connection_lost(&self, epoch: u64, end: StreamEnd) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }

        match inner.state {
            ConnectionState::Connecting | ConnectionState::AwaitingSetupAck => {
                // connect() owns the teardown of a failed attempt
                let err = match end {
                    StreamEnd::Closed(reason) => SessionError::SetupRejected(reason),
                    StreamEnd::Failed(reason) => SessionError::ConnectionError(reason),
                };
                if let Some(ack) = inner.pending_ack.take() {
                    let _ = ack.send(Err(err));
                }
            }
            ConnectionState::Active => {
                let reason = match end {
                    StreamEnd::Closed(reason) | StreamEnd::Failed(reason) => reason,
                };
                let err = SessionError::ConnectionError(reason);
                error!("{}", err);
                inner.teardown();
                self.emit(SessionEvent::Error(err));
                self.emit(SessionEvent::Disconnected);
            }
            ConnectionState::Disconnected => {}
        }
    }

    /// Tear down a failed attempt if it is still the current one. An attempt
    /// whose ack landed after the setup timer fired is kept.
    fn abandon(&self, epoch: u64) -> Abandon {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return Abandon::Superseded;
        }
        if inner.state == ConnectionState::Active {
            return Abandon::AlreadyActive;
        }
        inner.teardown();
        Abandon::TornDown
    }
}

async fn write_loop(mut sink: WsSink, mut outbound: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!("WebSocket send failed: {}", e);
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("WebSocket close: {}", e);
    }
    debug!("Outbound task terminated");
}

async fn read_loop(shared: Arc<Shared>, mut stream: WsStream, epoch: u64) {
    debug!("Inbound task started");

    let end = loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                if !shared.dispatch(epoch, text.as_str()) {
                    return;
                }
            }
            Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => {
                    if !shared.dispatch(epoch, text) {
                        return;
                    }
                }
                Err(_) => debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
            },
            Some(Ok(WsMessage::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                let reason = match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("{} ({})", frame.reason.as_str(), u16::from(frame.code))
                    }
                    Some(frame) => format!("closed with code {}", u16::from(frame.code)),
                    None => "connection closed".to_string(),
                };
                break StreamEnd::Closed(reason);
            }
            // Ping/pong are answered by tungstenite
            Some(Ok(_)) => {}
            Some(Err(e)) => break StreamEnd::Failed(e.to_string()),
            None => break StreamEnd::Closed("connection closed".to_string()),
        }
    };

    shared.connection_lost(epoch, end);
    debug!("Inbound task terminated");
}

/// Clonable sending side of a session.
///
/// Handed to the capture pipeline as its sink, and usable from any thread.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Send a complete user turn. No-op unless the session is active.
    pub fn send_text(&self, text: &str) {
        self.shared.send(gemini::text_turn(text), "text turn");
    }

    /// Send one block of 16 kHz PCM16 microphone audio.
    pub fn send_audio_chunk(&self, pcm16: &[u8]) {
        self.shared
            .send(gemini::media_chunk(AUDIO_MIME_TYPE, pcm16), "audio chunk");
    }

    /// Send one JPEG still.
    pub fn send_video_frame(&self, jpeg: &[u8]) {
        self.shared
            .send(gemini::media_chunk(JPEG_MIME_TYPE, jpeg), "video frame");
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }
}

impl AudioChunkSink for SessionHandle {
    fn send_audio_chunk(&self, pcm16: &[u8]) {
        SessionHandle::send_audio_chunk(self, pcm16);
    }
}

/// A real-time conversation with the Gemini Live API.
pub struct Session {
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session on the PulseAudio backend. No I/O happens until
    /// [`connect`](Self::connect).
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let backend = Arc::new(PulseBackend::new(&config.app_name));
        Self::with_backend(config, backend)
    }

    pub fn with_backend(
        config: SessionConfig,
        backend: Arc<dyn AudioBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(&config, backend, events_tx));
        (Self { config, shared }, events_rx)
    }

    /// Open the connection and complete the setup handshake.
    ///
    /// Candidate models are tried in order while the remote rejects setup.
    /// Transport failures and timeouts end the attempt immediately.
    pub async fn connect(&self, token: &str) -> Result<()> {
        let models = &self.config.models;

        for (index, model) in models.iter().enumerate() {
            let epoch = {
                let mut inner = self.shared.lock();
                if inner.state != ConnectionState::Disconnected {
                    return Err(SessionError::AlreadyConnected);
                }
                inner.state = ConnectionState::Connecting;
                inner.epoch
            };

            let err = match self.attempt(token, model, epoch).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            match self.shared.abandon(epoch) {
                Abandon::TornDown => {}
                // disconnect() got there first
                Abandon::Superseded => return Err(err),
                Abandon::AlreadyActive => {
                    debug!("Setup ack raced the failure ({}), keeping connection", err);
                    return Ok(());
                }
            }

            match err {
                SessionError::SetupRejected(reason) if index + 1 < models.len() => {
                    warn!(
                        "Model {} rejected setup ({}), trying next candidate",
                        model, reason
                    );
                }
                err => {
                    error!("Connect failed: {}", err);
                    self.shared.emit(SessionEvent::Error(err.clone()));
                    return Err(err);
                }
            }
        }

        Err(SessionError::SetupRejected(
            "no candidate models configured".to_string(),
        ))
    }

    async fn attempt(&self, token: &str, model: &str, epoch: u64) -> Result<()> {
        info!("Connecting to {} with model {}", self.config.endpoint, model);

        let (ws_stream, response) = connect_async(self.config.url(token)).await?;
        debug!("WebSocket handshake response: {:?}", response.status());

        let setup = gemini::setup_message(&self.config, model)
            .to_json()
            .map_err(|e| SessionError::ConnectionError(e.to_string()))?;

        let (sink, stream) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = oneshot::channel();

        {
            let mut inner = self.shared.lock();
            if inner.epoch != epoch {
                return Err(SessionError::ConnectionError(
                    "disconnected while connecting".to_string(),
                ));
            }

            tokio::spawn(write_loop(sink, outbound_rx));
            // Setup is always the first frame on the wire
            let _ = outbound_tx.send(WsMessage::Text(setup.into()));

            inner.outbound = Some(outbound_tx);
            inner.pending_ack = Some(ack_tx);
            inner.state = ConnectionState::AwaitingSetupAck;
            inner.reader = Some(tokio::spawn(read_loop(self.shared.clone(), stream, epoch)));
        }
        info!("Setup sent, waiting for acknowledgment");

        match tokio::time::timeout(self.config.setup_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::ConnectionError(
                "setup acknowledgment channel closed".to_string(),
            )),
            Err(_) => Err(SessionError::ConnectionError(format!(
                "no setup acknowledgment within {:?}",
                self.config.setup_timeout
            ))),
        }
    }

    /// Close the connection and release per-connection resources.
    ///
    /// Stops capture, drops queued playback and discards partial transcripts
    /// without emitting them. Safe to call from any state.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        let previous = inner.teardown();
        if previous != ConnectionState::Disconnected {
            info!("Session disconnected");
        }
        if previous == ConnectionState::Active {
            self.shared.emit(SessionEvent::Disconnected);
        }
    }

    pub fn send_text(&self, text: &str) {
        self.handle().send_text(text);
    }

    pub fn send_audio_chunk(&self, pcm16: &[u8]) {
        self.handle().send_audio_chunk(pcm16);
    }

    pub fn send_video_frame(&self, jpeg: &[u8]) {
        self.handle().send_video_frame(jpeg);
    }

    /// Start streaming the microphone into this session.
    ///
    /// A capture failure is returned to the caller and leaves the
    /// connection untouched.
    pub fn start_capture(&self) -> std::result::Result<(), CaptureError> {
        let sink: Arc<dyn AudioChunkSink> = Arc::new(self.handle());
        let mut inner = self.shared.lock();
        inner.capture.start(sink)
    }

    pub fn stop_capture(&self) {
        self.shared.lock().capture.stop();
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.lock().capture.is_running()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
        self.shared.lock().playback.close();
    }
}
