use speech_protocol::{error_codes, ProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Transport-level failures on a single gateway connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("Handshake with {url} rejected: {status} - {message}")]
    Handshake {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Failed to connect to {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<ConnectionError>,
    },

    #[error("Connection closed abnormally ({code}): {reason}")]
    ClosedAbnormally { code: u16, reason: String },

    #[error("WebSocket error: {0}")]
    Transport(String),

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl ConnectionError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ConnectionError::ConnectTimeout(_)
            | ConnectionError::WriteTimeout(_)
            | ConnectionError::ReadTimeout(_) => true,
            ConnectionError::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// Whether a fresh connection attempt could succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectionError::Handshake { status, .. } => *status >= 500,
            ConnectionError::Cancelled
            | ConnectionError::InvalidUrl(_)
            | ConnectionError::Tls(_)
            | ConnectionError::RetriesExhausted { .. } => false,
            _ => true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,

    #[error("Session is not ready")]
    NotReady,

    #[error("A synthesis round is already in progress")]
    RoundInFlight,
}

/// An `error` frame reported by the gateway, passed through verbatim
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ServerError {
    pub code: String,
    pub message: String,
}

impl ServerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("Connection error: {0}")]
    Connection(ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, SpeechError>;

impl From<ConnectionError> for SpeechError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Cancelled => SpeechError::Cancelled,
            other => SpeechError::Connection(other),
        }
    }
}

impl From<std::io::Error> for SpeechError {
    fn from(err: std::io::Error) -> Self {
        SpeechError::Io(err.to_string())
    }
}

impl SpeechError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SpeechError::Connection(e) if e.is_timeout())
    }

    /// Transient connection failures and gateway back-off signals
    pub fn is_retryable(&self) -> bool {
        match self {
            SpeechError::Connection(e) => e.is_retryable(),
            SpeechError::Server(e) => matches!(
                e.code.as_str(),
                error_codes::RATE_LIMIT_ERROR | error_codes::SERVICE_UNAVAILABLE
            ),
            _ => false,
        }
    }

    /// The gateway error code, if this error came from an `error` frame
    pub fn server_code(&self) -> Option<&str> {
        match self {
            SpeechError::Server(e) => Some(&e.code),
            _ => None,
        }
    }
}
