//! Relay between browser-reachable WebSocket channels and TCP endpoints.
//!
//! A client that can only speak a message-framed transport opens
//! `GET /ws/{host}/{port}`; every binary frame it sends is written verbatim
//! to a TCP connection opened lazily on the first frame, and everything the
//! TCP peer sends comes back as binary frames. The bridge never inspects the
//! relayed bytes, so any byte-oriented protocol (SSH, SMTP, raw HTTP, ...)
//! can run over it unchanged.

pub mod bridge;
pub mod error;
pub mod server;
pub mod target;

pub use bridge::{BridgeConfig, BridgeSession, BridgeState};
pub use error::BridgeError;
pub use server::{BridgeServer, ServerConfig};
pub use target::Target;
