//! # Speech Client
//!
//! Streaming speech-to-text and text-to-speech client for the speech gateway.
//!
//! - [`RecognitionClient`] opens [`RecognitionSession`]s: audio goes up as
//!   `audio.append` frames and transcripts come back as [`RecognitionEvent`]s.
//! - [`SynthesisClient`] opens [`SynthesisSession`]s: each round turns text
//!   into an [`AudioStream`] that is read like any other async reader.
//!
//! Every session owns one WebSocket [`Connection`]. Connections share a
//! process-wide TLS session cache so repeat `wss://` handshakes resume.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use speech_client::{SynthesisClient, SynthesisConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> speech_client::Result<()> {
//! let client = SynthesisClient::new(SynthesisConfig::from_env()?)?;
//! let audio = client
//!     .synthesize_to_bytes("你好，世界", &CancellationToken::new())
//!     .await?;
//! println!("{} bytes of audio", audio.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod stt;
pub mod transport;
pub mod tts;

pub use config::{
    ConnectionConfig, RecognitionConfig, StreamOptions, SynthesisConfig, SynthesisOptions,
};
pub use error::{ConfigError, ConnectionError, Result, ServerError, SessionError, SpeechError};
pub use stt::{
    RecognitionClient, RecognitionEvent, RecognitionEvents, RecognitionResult,
    RecognitionSession, RecognitionState, Segment,
};
pub use transport::{Connection, Inbound, TlsSessionCache};
pub use tts::{AudioChunk, AudioStream, SynthesisClient, SynthesisSession, SynthesisState};

pub use speech_protocol;
