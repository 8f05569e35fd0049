//! Delivery logic and port definitions for Fleetbus.
//!
//! Everything here is independent of the filesystem and the network: the
//! reader-side ordering rule, the WebSocket codec, the hub's in-memory state,
//! and the `Brain`, `Transport`, and `SessionDirectory` ports that
//! `fleetbus-infra` and embedding applications implement.

pub mod brain;
pub mod delivery;
pub mod event;
pub mod hub;
pub mod session;
pub mod transport;
pub mod wire;
