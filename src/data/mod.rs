//! Persistence: the read-only unit-stat catalog and the durable player
//! store, both JSON files in the server's data directory.

pub mod catalog;
pub mod store;
