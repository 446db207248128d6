//! WebSocket transport: one [`Connection`] per session, plus the TLS session
//! cache those connections share.

pub mod connection;
pub mod tls;

pub use connection::{Connection, Inbound};
pub use tls::TlsSessionCache;
