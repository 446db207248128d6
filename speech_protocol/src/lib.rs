//! # Speech Protocol
//!
//! JSON message protocol spoken between speech clients and the speech gateway.
//!
//! Every frame is a single JSON object whose `type` field selects the variant.
//! This crate provides:
//! - The closed set of message tags ([`MessageType`]) with direction helpers
//! - Typed messages ([`Message`]) with constructors for every variant
//! - Parsing and encoding of frames
//!
//! ## Example Usage
//!
//! ```rust
//! use speech_protocol::{parse_type, Message, MessageType};
//!
//! # fn main() -> Result<(), speech_protocol::ProtocolError> {
//! let frame = Message::text_append("hello").to_bytes()?;
//! assert_eq!(parse_type(&frame)?, MessageType::TextAppend);
//!
//! let decoded = Message::from_bytes(&frame)?;
//! assert_eq!(decoded, Message::text_append("hello"));
//! # Ok(())
//! # }
//! ```

pub mod protocol;

// Re-export commonly used types
pub use protocol::{
    decode_audio, encode_audio, error_codes, parse_type, Message, MessageType, ProtocolError,
    SessionParams,
};
