//! Infrastructure layer for Fleetbus.
//!
//! The file-backed [`bus::MessageBus`], filesystem adapters (data directory,
//! session files, hub state file), the `fleetbus.toml` loader, and the
//! agent-side [`connector::Connector`] with its HTTP, file-bus, and WebSocket
//! push transports.

pub mod bus;
pub mod config;
pub mod connector;
pub mod filesystem;
