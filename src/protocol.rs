//! JSON wire format of the live speech session.
//!
//! Outbound messages are typed structs serialized once; inbound messages are
//! decoded at the boundary into a flat, ordered list of [`ServerEvent`]s so the
//! rest of the crate never inspects raw JSON.

use crate::codec::{AudioFrame, FramingError};
use crate::config::SessionParams;
use crate::turn::Speaker;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Invalid string encoding")]
    InvalidString,
}

/// Events the session loop reacts to, in wire order
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Raw PCM16 mono bytes at the output sample rate
    AudioDelta(Vec<u8>),
    TranscriptDelta { speaker: Speaker, text: String },
    TurnComplete,
    Interrupted,
    /// Error reported by the server, e.g. an abnormal close code
    Error(String),
    /// The connection dropped without a close handshake
    ConnectionLost(String),
    Closed(Option<String>),
}

// ---------------------------------------------------------------------------
// Client -> server

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub input_audio_transcription: TranscriptionConfig,
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Serializes as `{}`, which enables transcription with default settings
#[derive(Debug, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub data: String,
    pub mime_type: String,
}

impl ClientMessage {
    pub fn setup(params: &SessionParams) -> Self {
        let model = if params.model.starts_with("models/") {
            params.model.clone()
        } else {
            format!("models/{}", params.model)
        };
        let system_instruction = (!params.system_prompt.trim().is_empty()).then(|| Content {
            parts: vec![TextPart {
                text: params.system_prompt.clone(),
            }],
        });

        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: params.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
            input_audio_transcription: TranscriptionConfig::default(),
            output_audio_transcription: TranscriptionConfig::default(),
        })
    }

    pub fn audio(frame: &AudioFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                data: STANDARD.encode(frame.to_bytes()),
                mime_type: frame.mime_type(),
            }],
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Server -> client

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub input_transcription: Option<Transcription>,
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    pub text: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Binary websocket frames carry the same JSON as text frames
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidString)?;
        Self::parse(text)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into events: transcriptions, audio parts, then the
    /// interruption and turn-completion markers.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        let Some(content) = self.server_content else {
            return events;
        };

        for (speaker, transcription) in [
            (Speaker::User, content.input_transcription),
            (Speaker::Model, content.output_transcription),
        ] {
            if let Some(text) = transcription.and_then(|t| t.text) {
                if !text.is_empty() {
                    events.push(ServerEvent::TranscriptDelta { speaker, text });
                }
            }
        }

        if let Some(turn) = content.model_turn {
            for inline in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                match decode_inline_audio(&inline) {
                    Ok(bytes) => events.push(ServerEvent::AudioDelta(bytes)),
                    Err(e) => log::warn!("Protocol: Dropping audio part: {}", e),
                }
            }
        }

        if content.interrupted {
            events.push(ServerEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(ServerEvent::TurnComplete);
        }
        events
    }
}

fn decode_inline_audio(inline: &InlineData) -> Result<Vec<u8>, FramingError> {
    if let Some(mime) = inline.mime_type.as_deref() {
        if !mime.starts_with("audio/pcm") {
            log::debug!("Protocol: Unexpected inline mime type {}", mime);
        }
    }
    STANDARD
        .decode(inline.data.as_bytes())
        .map_err(|e| FramingError::Base64(e.to_string()))
}
