//! # TCR Game Server
//!
//! Authoritative match server for TCR, a two-player tower duel played over
//! plain TCP with one JSON message per line.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TCR SERVER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  data/            - Persistence                              │
//! │  ├── catalog.rs   - Read-only troop/tower base stats         │
//! │  └── store.rs     - Durable player profiles and accounts     │
//! │                                                              │
//! │  game/            - Game logic (authoritative)               │
//! │  ├── types.rs     - Unit kinds, instances, match state       │
//! │  ├── events.rs    - Engine event stream                      │
//! │  └── engine.rs    - Rules state machine and combat           │
//! │                                                              │
//! │  network/         - Networking                               │
//! │  ├── codec.rs     - Line-delimited JSON framing              │
//! │  ├── protocol.rs  - Message envelope and payloads            │
//! │  ├── matchmaker.rs- FIFO pairing queues                      │
//! │  ├── room.rs      - One running match                        │
//! │  └── server.rs    - TCP server, sessions, routing            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority model
//!
//! The server is the single source of truth. Clients send requests
//! (`SUMMON_TROOP`, `ATTACK`, ...); the engine validates them under one
//! lock per room and emits an ordered event stream that is fanned out to
//! both players together with a full state snapshot. Rule violations are
//! typed errors answered with an `ERROR` message; they never abort a
//! match.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod data;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use data::catalog::SpecCatalog;
pub use data::store::{PlayerStore, ProfileSnapshot};
pub use game::engine::GameEngine;
pub use game::types::{GameId, Mode, PlayerId, TowerKind, TroopKind};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
