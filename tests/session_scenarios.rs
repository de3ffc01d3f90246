//! End-to-end session scenarios against a scripted local Live API server.

use futures_util::{SinkExt, StreamExt};
use livetalk::codec::bytes_to_base64;
use livetalk::{
    AudioBackend, CaptureConfig, CaptureError, ConnectionState, InputStream, OutputDevice,
    PlaybackError, Role, Session, SessionConfig, SessionError, SessionEvent,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// In-memory audio backend with a hand-driven clock

#[derive(Default)]
struct AudioState {
    clock: f64,
    scheduled: Vec<(f64, usize)>,
    cancels: usize,
}

#[derive(Clone)]
struct FakeAudio {
    state: Arc<Mutex<AudioState>>,
    mic_available: bool,
}

impl FakeAudio {
    fn new(mic_available: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(AudioState::default())),
            mic_available,
        }
    }

    fn set_clock(&self, now: f64) {
        self.state.lock().unwrap().clock = now;
    }

    fn scheduled_starts(&self) -> Vec<f64> {
        self.state.lock().unwrap().scheduled.iter().map(|(t, _)| *t).collect()
    }
}

struct FakeOutput(Arc<Mutex<AudioState>>);

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.0.lock().unwrap().clock
    }

    fn schedule(&mut self, samples: Vec<f32>, start_time: f64) -> Result<(), PlaybackError> {
        self.0.lock().unwrap().scheduled.push((start_time, samples.len()));
        Ok(())
    }

    fn cancel_pending(&mut self) {
        self.0.lock().unwrap().cancels += 1;
    }

    fn close(&mut self) {}
}

struct HalfScaleMic;

impl InputStream for HalfScaleMic {
    fn read_block(&mut self, block: &mut [f32]) -> Result<(), CaptureError> {
        std::thread::sleep(Duration::from_millis(5));
        block.fill(0.5);
        Ok(())
    }
}

impl AudioBackend for FakeAudio {
    fn open_input(&self, _: u32, _: usize) -> Result<Box<dyn InputStream>, CaptureError> {
        if self.mic_available {
            Ok(Box::new(HalfScaleMic))
        } else {
            Err(CaptureError::Unavailable("permission denied".to_string()))
        }
    }

    fn open_output(&self, _: u32) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        Ok(Box::new(FakeOutput(self.state.clone())))
    }
}

// ---------------------------------------------------------------------------
// Scripted server
//
// Models containing "reject" are refused with a close frame, models
// containing "silent" are never acknowledged, anything else is accepted.

enum Action {
    Text(String),
    Binary(String),
    Close,
}

struct MockServer {
    endpoint: String,
    received: mpsc::UnboundedReceiver<Value>,
    actions: mpsc::UnboundedSender<Action>,
}

impl MockServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/live", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (actions, actions_rx) = mpsc::unbounded_channel();

        tokio::spawn(serve(listener, received_tx, actions_rx));

        Self {
            endpoint,
            received,
            actions,
        }
    }

    fn send(&self, frame: Value) {
        self.actions.send(Action::Text(frame.to_string())).unwrap();
    }

    fn send_raw(&self, action: Action) {
        self.actions.send(action).unwrap();
    }

    async fn next_received(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server stopped")
    }
}

async fn serve(
    listener: TcpListener,
    received: mpsc::UnboundedSender<Value>,
    mut actions: mpsc::UnboundedReceiver<Action>,
) {
    while let Ok((tcp, _)) = listener.accept().await {
        let Ok(ws) = accept_async(tcp).await else {
            continue;
        };
        let (mut write, mut read) = ws.split();

        let setup: Value = match read.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        };
        let model = setup["setup"]["model"].as_str().unwrap_or_default().to_string();
        let _ = received.send(setup);

        if model.contains("reject") {
            let frame = CloseFrame {
                code: CloseCode::Invalid,
                reason: "Unsupported model".into(),
            };
            let _ = write.send(Message::Close(Some(frame))).await;
            while let Some(Ok(_)) = read.next().await {}
            continue;
        }
        if model.contains("silent") {
            while let Some(Ok(_)) = read.next().await {}
            continue;
        }

        let ack = json!({"setupComplete": {}}).to_string();
        if write.send(Message::Text(ack.into())).await.is_err() {
            continue;
        }

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = received.send(serde_json::from_str(text.as_str()).unwrap());
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
                action = actions.recv() => {
                    let message = match action {
                        Some(Action::Text(text)) => Message::Text(text.into()),
                        Some(Action::Binary(text)) => Message::Binary(text.into_bytes().into()),
                        Some(Action::Close) => Message::Close(None),
                        None => return,
                    };
                    let _ = write.send(message).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers

fn config(server: &MockServer, models: &[&str]) -> SessionConfig {
    SessionConfig {
        endpoint: server.endpoint.clone(),
        models: models.iter().map(|m| m.to_string()).collect(),
        setup_timeout: Duration::from_millis(500),
        capture: CaptureConfig { block_size: 160 },
        ..Default::default()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

async fn assert_no_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(150), events.recv()).await {
        panic!("unexpected event {:?}", event);
    }
}

fn audio_frame(samples: usize) -> Value {
    json!({
        "serverContent": {
            "modelTurn": {"parts": [{
                "inlineData": {"mimeType": "audio/pcm;rate=24000", "data": bytes_to_base64(&vec![0u8; samples * 2])}
            }]}
        }
    })
}

async fn connected(
    server: &mut MockServer,
    backend: FakeAudio,
) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
    let (session, mut events) =
        Session::with_backend(config(server, &["models/live-test"]), Arc::new(backend));
    session.connect("test-token").await.unwrap();

    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert_eq!(server.next_received().await["setup"]["model"], "models/live-test");
    (session, events)
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn happy_path_turn_emits_one_model_message() {
    let mut server = MockServer::start().await;
    let (session, mut events) =
        Session::with_backend(config(&server, &["models/live-test"]), Arc::new(FakeAudio::new(true)));

    // Not active yet: dropped, never reaches the wire
    session.send_text("too early");
    session.connect("test-token").await.unwrap();
    assert_eq!(session.state(), ConnectionState::Active);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    let setup = server.next_received().await;
    assert_eq!(setup["setup"]["outputAudioTranscription"], json!({}));

    session.send_text("Tell me about this photo");
    let turn = server.next_received().await;
    assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], "Tell me about this photo");
    assert_eq!(turn["clientContent"]["turnComplete"], true);

    server.send(json!({"serverContent": {"outputTranscription": {"text": "I see a "}}}));
    server.send(json!({"serverContent": {"outputTranscription": {"text": "family gathering."}}}));
    server.send(json!({"serverContent": {"turnComplete": true}}));

    match next_event(&mut events).await {
        SessionEvent::Message(message) => {
            assert_eq!(message.role, Role::Model);
            assert_eq!(message.content, "I see a family gathering.");
        }
        other => panic!("expected a message, got {:?}", other),
    }
    assert!(matches!(next_event(&mut events).await, SessionEvent::TurnComplete));
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn barge_in_drops_queued_audio_and_resets_cursor() {
    let mut server = MockServer::start().await;
    let audio = FakeAudio::new(true);
    let (_session, mut events) = connected(&mut server, audio.clone()).await;

    // Three 100 ms parts, scheduled back to back from t = 0
    for _ in 0..3 {
        server.send(audio_frame(2400));
    }
    for _ in 0..3 {
        assert!(matches!(next_event(&mut events).await, SessionEvent::Audio(_)));
    }
    let starts = audio.scheduled_starts();
    assert!((starts[1] - 0.1).abs() < 1e-9 && (starts[2] - 0.2).abs() < 1e-9);

    // Interrupt before the third part starts
    audio.set_clock(0.15);
    server.send(json!({"serverContent": {"interrupted": true}}));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Interrupted));
    assert_eq!(audio.state.lock().unwrap().cancels, 1);

    server.send(audio_frame(2400));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Audio(_)));
    let starts = audio.scheduled_starts();
    assert!((starts[3] - 0.15).abs() < 1e-9, "restarted at {}", starts[3]);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn capture_failure_does_not_affect_session() {
    let mut server = MockServer::start().await;
    let (session, _events) = connected(&mut server, FakeAudio::new(false)).await;

    let result = session.start_capture();

    assert!(matches!(result, Err(CaptureError::Unavailable(_))));
    assert_eq!(session.state(), ConnectionState::Active);
    session.send_text("still here");
    let turn = server.next_received().await;
    assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], "still here");
}

#[tokio::test]
async fn microphone_blocks_stream_as_pcm16() {
    let mut server = MockServer::start().await;
    let (session, _events) = connected(&mut server, FakeAudio::new(true)).await;

    session.start_capture().unwrap();
    let frame = server.next_received().await;
    session.stop_capture();

    let chunk = &frame["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
    let pcm = livetalk::codec::base64_to_bytes(chunk["data"].as_str().unwrap()).unwrap();
    assert_eq!(pcm.len(), 320);
    // 0.5 full scale
    assert_eq!(&pcm[..2], &16384i16.to_le_bytes());
}

#[tokio::test]
async fn video_frame_is_sent_as_jpeg_chunk() {
    let mut server = MockServer::start().await;
    let (session, _events) = connected(&mut server, FakeAudio::new(true)).await;

    session.send_video_frame(&[0xff, 0xd8, 0xff, 0xd9]);

    let chunk = &server.next_received().await["realtimeInput"]["mediaChunks"][0];
    assert_eq!(chunk["mimeType"], "image/jpeg");
    assert_eq!(chunk["data"], "/9j/2Q==");
}

#[tokio::test]
async fn rejected_model_falls_back_to_next_candidate() {
    let mut server = MockServer::start().await;
    let (session, mut events) = Session::with_backend(
        config(&server, &["models/reject-me", "models/live-test"]),
        Arc::new(FakeAudio::new(true)),
    );

    session.connect("test-token").await.unwrap();

    assert_eq!(server.next_received().await["setup"]["model"], "models/reject-me");
    assert_eq!(server.next_received().await["setup"]["model"], "models/live-test");
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert_eq!(session.state(), ConnectionState::Active);
}

#[tokio::test]
async fn all_models_rejected_fails_connect() {
    let server = MockServer::start().await;
    let (session, mut events) = Session::with_backend(
        config(&server, &["models/reject-a", "models/reject-b"]),
        Arc::new(FakeAudio::new(true)),
    );

    let result = session.connect("test-token").await;

    assert!(matches!(result, Err(SessionError::SetupRejected(ref r)) if r.contains("Unsupported model")));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Error(SessionError::SetupRejected(_))
    ));
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn missing_setup_ack_times_out() {
    let server = MockServer::start().await;
    let (session, _events) = Session::with_backend(
        config(&server, &["models/silent"]),
        Arc::new(FakeAudio::new(true)),
    );

    let result = session.connect("test-token").await;

    assert!(matches!(result, Err(SessionError::ConnectionError(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_during_setup_cancels_connect() {
    let mut server = MockServer::start().await;
    let (session, mut events) = Session::with_backend(
        SessionConfig {
            setup_timeout: Duration::from_secs(10),
            ..config(&server, &["models/silent"])
        },
        Arc::new(FakeAudio::new(true)),
    );
    let started = Instant::now();

    let (result, ()) = tokio::join!(session.connect("test-token"), async {
        assert_eq!(server.next_received().await["setup"]["model"], "models/silent");
        session.disconnect();
    });

    assert!(matches!(result, Err(SessionError::ConnectionError(_))));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    // Never became active, and the caller asked for the teardown
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn connect_twice_is_rejected() {
    let mut server = MockServer::start().await;
    let (session, _events) = connected(&mut server, FakeAudio::new(true)).await;

    assert_eq!(
        session.connect("test-token").await,
        Err(SessionError::AlreadyConnected)
    );
    assert_eq!(session.state(), ConnectionState::Active);
}

#[tokio::test]
async fn malformed_frame_is_dropped_without_disconnect() {
    let mut server = MockServer::start().await;
    let (session, mut events) = connected(&mut server, FakeAudio::new(true)).await;

    server.send_raw(Action::Text("{\"serverContent\": [".to_string()));
    server.send(json!({"serverContent": {"inputTranscription": {"text": "hello"}, "turnComplete": true}}));

    match next_event(&mut events).await {
        SessionEvent::Message(message) => assert_eq!((message.role, message.content.as_str()), (Role::User, "hello")),
        other => panic!("expected a message, got {:?}", other),
    }
    assert_eq!(session.state(), ConnectionState::Active);
}

#[tokio::test]
async fn binary_json_frames_are_parsed() {
    let mut server = MockServer::start().await;
    let (_session, mut events) = connected(&mut server, FakeAudio::new(true)).await;

    server.send_raw(Action::Binary(
        json!({"serverContent": {"interrupted": true}}).to_string(),
    ));

    assert!(matches!(next_event(&mut events).await, SessionEvent::Interrupted));
}

#[tokio::test]
async fn go_away_keeps_session_active() {
    let mut server = MockServer::start().await;
    let (session, mut events) = connected(&mut server, FakeAudio::new(true)).await;

    server.send(json!({"goAway": {"timeLeft": "5s"}}));

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::GoAway { time_left: Some(ref t) } if t == "5s"
    ));
    assert_eq!(session.state(), ConnectionState::Active);
}

#[tokio::test]
async fn remote_close_reports_error_then_disconnect() {
    let mut server = MockServer::start().await;
    let (session, mut events) = connected(&mut server, FakeAudio::new(true)).await;

    server.send(json!({"serverContent": {"outputTranscription": {"text": "half a sen"}}}));
    server.send_raw(Action::Close);

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Error(SessionError::ConnectionError(_))
    ));
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
    assert_no_event(&mut events).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_is_idempotent_and_reconnect_works() {
    let mut server = MockServer::start().await;
    let (session, mut events) = connected(&mut server, FakeAudio::new(true)).await;
    server.send(json!({"serverContent": {"outputTranscription": {"text": "never finished"}}}));
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.disconnect();
    session.disconnect();
    session.send_text("after disconnect");

    // Partial transcript is discarded, not emitted
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
    assert_no_event(&mut events).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);

    session.connect("test-token").await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));
    assert_eq!(server.next_received().await["setup"]["model"], "models/live-test");
    session.send_text("second session");
    let turn = server.next_received().await;
    assert_eq!(turn["clientContent"]["turns"][0]["parts"][0]["text"], "second session");
}

/// Runs against the real service only when `GEMINI_API_KEY` is set.
#[tokio::test]
async fn live_api_handshake() {
    let Ok(api_key) = std::env::var("GEMINI_API_KEY") else {
        eprintln!("GEMINI_API_KEY not set, skipping");
        return;
    };

    let (session, mut events) =
        Session::with_backend(SessionConfig::from_env(), Arc::new(FakeAudio::new(false)));
    session.connect(&api_key).await.unwrap();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Connected));

    session.disconnect();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Disconnected));
}
