use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame has no type field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: MessageType,
        got: MessageType,
    },

    #[error("Invalid audio payload: {0}")]
    InvalidAudio(String),
}

/// Error codes the gateway puts in `error` frames
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
    pub const AUTH_ERROR: &str = "AUTH_ERROR";
    pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_ERROR";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const UNSUPPORTED: &str = "UNSUPPORTED";
    /// Gateway-side misconfiguration
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const VOICE_NOT_FOUND: &str = "VOICE_NOT_FOUND";
}

/// Wire tags for every frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display, IntoStaticStr)]
pub enum MessageType {
    // Client → Server
    #[strum(serialize = "session.config")]
    SessionConfig,
    #[strum(serialize = "audio.append")]
    AudioAppend,
    #[strum(serialize = "text.append")]
    TextAppend,
    #[strum(serialize = "input.commit")]
    InputCommit,
    #[strum(serialize = "session.end")]
    SessionEnd,

    // Server → Client
    #[strum(serialize = "session.ready")]
    SessionReady,
    #[strum(serialize = "session.config_done")]
    SessionConfigDone,
    #[strum(serialize = "transcript.partial")]
    TranscriptPartial,
    #[strum(serialize = "transcript.final")]
    TranscriptFinal,
    #[strum(serialize = "audio.delta")]
    AudioDelta,
    #[strum(serialize = "audio.done")]
    AudioDone,
    #[strum(serialize = "input.done")]
    InputDone,
    #[strum(serialize = "processing")]
    Processing,
    #[strum(serialize = "error")]
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 14] = [
        MessageType::SessionConfig,
        MessageType::AudioAppend,
        MessageType::TextAppend,
        MessageType::InputCommit,
        MessageType::SessionEnd,
        MessageType::SessionReady,
        MessageType::SessionConfigDone,
        MessageType::TranscriptPartial,
        MessageType::TranscriptFinal,
        MessageType::AudioDelta,
        MessageType::AudioDone,
        MessageType::InputDone,
        MessageType::Processing,
        MessageType::Error,
    ];

    /// The tag as it appears in the `type` field
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Frames the client sends to the gateway
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            MessageType::SessionConfig
                | MessageType::AudioAppend
                | MessageType::TextAppend
                | MessageType::InputCommit
                | MessageType::SessionEnd
        )
    }

    /// Frames the gateway sends to the client
    pub fn is_server(&self) -> bool {
        !self.is_client()
    }

    pub fn is_error(&self) -> bool {
        *self == MessageType::Error
    }
}

/// Parameters carried by `session.config`.
///
/// Unset fields are left out of the frame so the gateway applies its own
/// defaults. The recognition fields and the synthesis fields share one object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vad: Option<bool>,

    // Synthesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

/// Messages that can be sent/received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    // Client → Server
    #[serde(rename = "session.config")]
    SessionConfig {
        #[serde(default)]
        session: SessionParams,
    },
    #[serde(rename = "audio.append")]
    AudioAppend {
        /// Base64 PCM chunk
        #[serde(default)]
        audio: String,
    },
    #[serde(rename = "text.append")]
    TextAppend {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "input.commit")]
    InputCommit,
    #[serde(rename = "session.end")]
    SessionEnd,

    // Server → Client
    #[serde(rename = "session.ready")]
    SessionReady {
        #[serde(default)]
        session_id: String,
    },
    #[serde(rename = "session.config_done")]
    SessionConfigDone,
    #[serde(rename = "transcript.partial")]
    TranscriptPartial {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "transcript.final")]
    TranscriptFinal {
        #[serde(default)]
        text: String,
        /// Milliseconds from the start of the audio
        #[serde(default, skip_serializing_if = "is_zero")]
        start_time: i64,
        #[serde(default, skip_serializing_if = "is_zero")]
        end_time: i64,
    },
    #[serde(rename = "audio.delta")]
    AudioDelta {
        #[serde(default)]
        audio: String,
    },
    #[serde(rename = "audio.done")]
    AudioDone,
    #[serde(rename = "input.done")]
    InputDone,
    /// Keep-alive while the provider is still working
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
    },
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Extract only the `type` discriminant from a frame
pub fn parse_type(bytes: &[u8]) -> Result<MessageType, ProtocolError> {
    let raw: RawMessage =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let kind = raw.kind.ok_or(ProtocolError::MissingType)?;
    MessageType::from_str(&kind).map_err(|_| ProtocolError::UnknownType(kind))
}

/// Base64-encode raw audio for `audio.append` / `audio.delta`
pub fn encode_audio(audio: &[u8]) -> String {
    BASE64.encode(audio)
}

/// Decode a base64 audio payload
pub fn decode_audio(encoded: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(encoded)
        .map_err(|e| ProtocolError::InvalidAudio(e.to_string()))
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::SessionConfig { .. } => MessageType::SessionConfig,
            Message::AudioAppend { .. } => MessageType::AudioAppend,
            Message::TextAppend { .. } => MessageType::TextAppend,
            Message::InputCommit => MessageType::InputCommit,
            Message::SessionEnd => MessageType::SessionEnd,
            Message::SessionReady { .. } => MessageType::SessionReady,
            Message::SessionConfigDone => MessageType::SessionConfigDone,
            Message::TranscriptPartial { .. } => MessageType::TranscriptPartial,
            Message::TranscriptFinal { .. } => MessageType::TranscriptFinal,
            Message::AudioDelta { .. } => MessageType::AudioDelta,
            Message::AudioDone => MessageType::AudioDone,
            Message::InputDone => MessageType::InputDone,
            Message::Processing => MessageType::Processing,
            Message::Error { .. } => MessageType::Error,
        }
    }

    /// Serialize message to a JSON frame
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Serialize message to a JSON text frame
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Deserialize a frame.
    ///
    /// The tag is checked first so an unrecognised `type` is reported as
    /// [`ProtocolError::UnknownType`] rather than a generic decode failure.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let expected = parse_type(bytes)?;
        let message: Message =
            serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        debug_assert_eq!(message.message_type(), expected);
        Ok(message)
    }

    // Client → Server

    pub fn session_config(session: SessionParams) -> Self {
        Message::SessionConfig { session }
    }

    pub fn audio_append(audio_base64: impl Into<String>) -> Self {
        Message::AudioAppend {
            audio: audio_base64.into(),
        }
    }

    pub fn audio_append_bytes(audio: &[u8]) -> Self {
        Message::AudioAppend {
            audio: encode_audio(audio),
        }
    }

    pub fn text_append(text: impl Into<String>) -> Self {
        Message::TextAppend { text: text.into() }
    }

    pub fn input_commit() -> Self {
        Message::InputCommit
    }

    pub fn session_end() -> Self {
        Message::SessionEnd
    }

    // Server → Client

    pub fn session_ready(session_id: impl Into<String>) -> Self {
        Message::SessionReady {
            session_id: session_id.into(),
        }
    }

    pub fn session_config_done() -> Self {
        Message::SessionConfigDone
    }

    pub fn transcript_partial(text: impl Into<String>) -> Self {
        Message::TranscriptPartial { text: text.into() }
    }

    pub fn transcript_final(text: impl Into<String>, start_time: i64, end_time: i64) -> Self {
        Message::TranscriptFinal {
            text: text.into(),
            start_time,
            end_time,
        }
    }

    pub fn audio_delta(audio_base64: impl Into<String>) -> Self {
        Message::AudioDelta {
            audio: audio_base64.into(),
        }
    }

    pub fn audio_delta_bytes(audio: &[u8]) -> Self {
        Message::AudioDelta {
            audio: encode_audio(audio),
        }
    }

    pub fn audio_done() -> Self {
        Message::AudioDone
    }

    pub fn input_done() -> Self {
        Message::InputDone
    }

    pub fn processing() -> Self {
        Message::Processing
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
