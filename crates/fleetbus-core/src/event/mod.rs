//! Typed hub event channel.
//!
//! Subscribers (the audit writer, embedding applications) receive every
//! [`HubEvent`](fleetbus_types::event::HubEvent) the hub publishes.

pub mod bus;

pub use bus::EventBus;
