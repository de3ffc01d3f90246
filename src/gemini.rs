//! Gemini Live wire format
//!
//! Every frame is a JSON object. Outbound frames are built from the typed
//! structs below; inbound frames are parsed into a short list of
//! [`InboundEvent`]s, since one frame can carry audio, transcripts and a
//! turn boundary together.

use crate::codec::{base64_to_bytes, bytes_to_base64};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::InboundEvent;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::warn;

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Session setup message.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub input_audio_transcription: Empty,
    pub output_audio_transcription: Empty,
}

/// Serializes as `{}`; its presence alone enables a feature.
#[derive(Debug, Serialize, Default, Clone)]
pub struct Empty {}

#[derive(Debug, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Clone)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize, Clone)]
pub struct Part {
    pub text: String,
}

/// A complete, immediately closed turn.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Model ids must carry the `models/` prefix on the wire.
pub fn model_resource(model: &str) -> String {
    if model.starts_with("models/") {
        model.to_string()
    } else {
        format!("models/{}", model)
    }
}

/// Setup frame for `model` with transcription enabled in both directions.
pub fn setup_message(config: &SessionConfig, model: &str) -> ClientMessage {
    let speech_config = config.voice.as_ref().map(|voice| SpeechConfig {
        voice_config: VoiceConfig {
            prebuilt_voice_config: PrebuiltVoiceConfig {
                voice_name: voice.clone(),
            },
        },
    });

    ClientMessage::Setup(Setup {
        model: model_resource(model),
        generation_config: GenerationConfig {
            response_modalities: config
                .response_modalities
                .iter()
                .map(|m| m.as_str().to_string())
                .collect(),
            speech_config,
        },
        system_instruction: config.system_instruction.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part { text: text.clone() }],
        }),
        input_audio_transcription: Empty {},
        output_audio_transcription: Empty {},
    })
}

pub fn text_turn(text: &str) -> ClientMessage {
    ClientMessage::ClientContent(ClientContent {
        turns: vec![Content {
            role: Some("user".to_string()),
            parts: vec![Part {
                text: text.to_string(),
            }],
        }],
        turn_complete: true,
    })
}

pub fn media_chunk(mime_type: &str, bytes: &[u8]) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        media_chunks: vec![Blob {
            mime_type: mime_type.to_string(),
            data: bytes_to_base64(bytes),
        }],
    })
}

/// Server -> client frame. Unknown fields are ignored.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    interrupted: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    inline_data: Option<InlineData>,
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize, Default)]
struct InlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize, Default)]
struct Transcription {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

pub type InboundEvents = SmallVec<[InboundEvent; 4]>;

/// Parse one inbound frame.
///
/// Events come out as: setup ack, audio/text parts, input transcript,
/// output transcript, interrupted, turn complete, go-away. A well-formed
/// frame with nothing we understand yields no events.
pub fn parse_server_frame(text: &str) -> Result<InboundEvents, SessionError> {
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| SessionError::MalformedFrame(e.to_string()))?;
    let mut events = InboundEvents::new();

    if message.setup_complete.is_some() {
        events.push(InboundEvent::SetupAck);
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    match base64_to_bytes(&inline.data) {
                        Ok(bytes) if !bytes.is_empty() => events.push(InboundEvent::AudioPart(bytes)),
                        Ok(_) => {}
                        Err(e) => warn!("Dropping audio part: {}", e),
                    }
                } else if let Some(text) = part.text {
                    // Text parts only appear with a TEXT modality; thoughts are not speech
                    if !part.thought && !text.is_empty() {
                        events.push(InboundEvent::OutputTranscriptChunk(text));
                    }
                }
            }
        }

        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::InputTranscriptChunk(t.text));
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::OutputTranscriptChunk(t.text));
        }
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
    }

    if let Some(go_away) = message.go_away {
        events.push(InboundEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    Ok(events)
}
