//! Networking: TCP transport, wire protocol, matchmaking, rooms, and the
//! top-level server.

pub mod codec;
pub mod matchmaker;
pub mod protocol;
pub mod room;
pub mod server;
