//! WebSocket connections and the actor that owns their sessions.

pub mod api;
pub mod handler;
pub mod server;

/// Registry key of a connected client.
pub type ConnId = u64;

/// JSON-encoded text frame sent to a client.
pub type Msg = String;
