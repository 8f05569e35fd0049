//! Broadcast channel for `HubEvent`.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no subscribers is a
//! no-op, and a slow subscriber lags rather than blocking the hub.

use fleetbus_types::event::HubEvent;
use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Multi-consumer channel for hub lifecycle events.
pub struct EventBus {
    sender: broadcast::Sender<HubEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: HubEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbus_types::event::Via;

    fn registered(session_id: &str) -> HubEvent {
        HubEvent::AgentRegistered {
            session_id: session_id.to_string(),
            role: "dev".to_string(),
            via: Via::Http,
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(registered("S-1"));

        assert_eq!(rx1.recv().await.unwrap().session_id(), "S-1");
        assert_eq!(rx2.recv().await.unwrap().session_id(), "S-1");
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(registered("S-1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn lagging_subscriber_sees_lag_not_panic() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(registered(&format!("S-{i}")));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(4);
        let other = bus.clone();
        let mut rx = bus.subscribe();
        other.publish(registered("S-9"));
        assert!(rx.try_recv().is_ok());
    }
}
