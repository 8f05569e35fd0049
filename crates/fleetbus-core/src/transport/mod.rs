//! The connector's transport port.
//!
//! A connector holds exactly one active transport, chosen at connect time:
//! the hub over HTTP, or the shared file bus when the hub is unreachable.

pub mod box_transport;

use std::future::Future;

use fleetbus_types::connector::{Outbound, TransportKind};
use fleetbus_types::error::TransportError;

pub use box_transport::{BoxTransport, TransportDyn};

/// Carries outbound agent messages somewhere the PM will see them.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver one message on behalf of `session_id`.
    ///
    /// Returns the hub's response body or a description of what was written.
    fn send(
        &self,
        session_id: &str,
        message: &Outbound,
    ) -> impl Future<Output = Result<serde_json::Value, TransportError>> + Send;

    /// Release any sockets or handles. Called once on disconnect.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
