//! The Fleetbus hub.
//!
//! [`hub::Hub`] owns the in-memory agent registry and serves it over HTTP and
//! the hand-rolled WebSocket endpoint in [`http`]. The `fleetbus` binary in
//! `main.rs` wraps it, and the bus, in a CLI.

pub mod http;
pub mod hub;
