//! Protocol types shared between the Wormhole daemon and its clients.
//!
//! `protocol` holds the WebSocket wire protocol (client ↔ daemon),
//! `control` the local control-plane protocol (CLI ↔ daemon), and
//! `timestamp` the ISO-8601 serde helpers both use.

pub mod control;
pub mod protocol;
pub mod timestamp;
