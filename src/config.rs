//! Session configuration.

use crate::capture::CaptureConfig;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Output modalities the model may respond with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Text,
    Audio,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint, without query string.
    pub endpoint: String,
    /// Query parameter carrying the credential (`key` for API keys,
    /// `access_token` for ephemeral tokens).
    pub auth_param: String,
    /// Candidate model ids, tried in order when setup is rejected.
    pub models: Vec<String>,
    pub response_modalities: Vec<Modality>,
    pub system_instruction: Option<String>,
    /// Prebuilt synthetic voice name.
    pub voice: Option<String>,
    /// How long `connect()` waits for the setup acknowledgment.
    pub setup_timeout: Duration,
    pub capture: CaptureConfig,
    /// Application name reported to the audio server.
    pub app_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            auth_param: "key".to_string(),
            models: vec![
                "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                "models/gemini-live-2.5-flash-preview".to_string(),
                "models/gemini-2.0-flash-live-001".to_string(),
            ],
            response_modalities: vec![Modality::Audio],
            system_instruction: None,
            voice: Some("Puck".to_string()),
            setup_timeout: Duration::from_secs(10),
            capture: CaptureConfig::default(),
            app_name: "livetalk".to_string(),
        }
    }
}

impl SessionConfig {
    /// Defaults overlaid with `LIVETALK_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(endpoint) = get("LIVETALK_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(param) = get("LIVETALK_AUTH_PARAM") {
            config.auth_param = param;
        }
        if let Some(models) = get("LIVETALK_MODELS") {
            let models: Vec<String> = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
            if !models.is_empty() {
                config.models = models;
            }
        }
        if let Some(voice) = get("LIVETALK_VOICE") {
            config.voice = Some(voice);
        }
        if let Some(instruction) = get("LIVETALK_SYSTEM_INSTRUCTION") {
            config.system_instruction = Some(instruction);
        }

        debug!("Session config: {:?}", config);
        config
    }

    /// Full connection URL for `token`. The token is query-encoded.
    pub fn url(&self, token: &str) -> String {
        let token: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
        format!("{}?{}={}", self.endpoint, self.auth_param, token)
    }
}
