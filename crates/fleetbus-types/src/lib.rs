//! Shared domain types for Fleetbus.
//!
//! Envelopes, cursors, ACK bookkeeping, agent records, hub wire frames,
//! connector messages, configuration, and the error enums used by every other crate.
//!
//! Zero infrastructure dependencies -- only serde, serde_json, chrono, thiserror.

pub mod ack;
pub mod agent;
pub mod config;
pub mod connector;
pub mod cursor;
pub mod envelope;
pub mod error;
pub mod event;
pub mod hub;
