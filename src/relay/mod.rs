//! Signaling relay implementations.
//!
//! `hub` holds the room and inbox bookkeeping, `local` exposes it in-process,
//! and `server`/`client` carry it over WebSocket using the frames defined in
//! `protocol`.

pub mod client;
pub mod hub;
pub mod local;
pub mod protocol;
pub mod server;
