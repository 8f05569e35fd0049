//! Shared hub state handed to every handler.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::time::Duration;

use chrono::Utc;
use fleetbus_core::brain::BoxBrain;
use fleetbus_core::event::EventBus;
use fleetbus_core::hub::{AgentRegistry, RateLimiter};
use fleetbus_core::session::SessionDirectory;
use fleetbus_infra::bus::MessageBus;
use fleetbus_types::agent::HubStatus;
use fleetbus_types::config::HubConfig;
use fleetbus_types::envelope::{BROADCAST, EnvelopeDraft, HUB_SENDER, MessageKind, Priority};
use fleetbus_types::event::HubEvent;
use tracing::{debug, warn};

/// Everything the hub's handlers touch.
pub struct HubShared {
    pub config: HubConfig,
    /// Connected agents and their push links.
    pub registry: AgentRegistry,
    /// Per-IP request budget.
    pub limiter: RateLimiter,
    /// In-process fan-out of hub events.
    pub events: EventBus,
    /// Durable log; hub events are audited onto it.
    pub bus: Arc<MessageBus>,
    /// Decides which session ids may register.
    pub sessions: Arc<dyn SessionDirectory>,
    /// PM answering backend, if one is configured.
    pub brain: Option<BoxBrain>,
    listening: AtomicBool,
    port: AtomicU16,
}

/// Cheaply clonable handle to [`HubShared`], used as axum state.
#[derive(Clone)]
pub struct HubState(Arc<HubShared>);

impl Deref for HubState {
    type Target = HubShared;

    fn deref(&self) -> &HubShared {
        &self.0
    }
}

impl HubState {
    pub fn new(
        config: HubConfig,
        bus: Arc<MessageBus>,
        sessions: Arc<dyn SessionDirectory>,
        brain: Option<BoxBrain>,
    ) -> Self {
        let limiter = RateLimiter::new(
            config.rate_limit_max,
            Duration::from_millis(config.rate_limit_window_ms),
        );
        Self(Arc::new(HubShared {
            registry: AgentRegistry::new(config.pending_queue_capacity),
            limiter,
            events: EventBus::default(),
            bus,
            sessions,
            brain,
            listening: AtomicBool::new(false),
            port: AtomicU16::new(0),
            config,
        }))
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Bound port, or `None` while not listening.
    pub fn port(&self) -> Option<u16> {
        self.is_listening().then(|| self.port.load(Ordering::Acquire))
    }

    pub(crate) fn set_listening(&self, port: Option<u16>) {
        self.port.store(port.unwrap_or(0), Ordering::Release);
        self.listening.store(port.is_some(), Ordering::Release);
    }

    /// Publish `event` and mirror it to the bus as an audit record.
    ///
    /// Audit failures are logged; they never fail the request that caused them.
    pub async fn record(&self, event: HubEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "cannot serialize hub event");
                serde_json::Value::Null
            }
        };
        let draft = EnvelopeDraft::new(
            MessageKind::Notify,
            HUB_SENDER,
            BROADCAST,
            event.topic(),
            payload,
        )
        .with_priority(Priority::Fyi);

        match self.bus.append(draft).await {
            Ok(envelope) => debug!(
                event = event.name(),
                session_id = %event.session_id(),
                message_id = %envelope.id,
                "audited hub event"
            ),
            Err(err) => warn!(event = event.name(), error = %err, "audit append failed"),
        }
        self.events.publish(event);
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            listening: self.is_listening(),
            port: self.port(),
            connected_agents: self.registry.len(),
            agents: self
                .registry
                .statuses(Utc::now(), self.config.heartbeat_stale_ms),
            brain_available: self.brain.is_some(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use fleetbus_core::brain::Brain;
    use fleetbus_infra::filesystem::SessionFiles;
    use fleetbus_types::config::BusConfig;
    use fleetbus_types::error::BrainError;
    use fleetbus_types::hub::PmAnswer;
    use tempfile::TempDir;

    /// Answers every question with a fixed line, echoing the asker.
    pub struct ScriptedBrain;

    impl Brain for ScriptedBrain {
        async fn ask(
            &self,
            session_id: &str,
            question: &str,
            _context: &serde_json::Value,
        ) -> Result<PmAnswer, BrainError> {
            let mut answer = PmAnswer::new(format!("{session_id}: proceed with '{question}'"));
            answer
                .extra
                .insert("confidence".into(), serde_json::json!("high"));
            Ok(answer)
        }
    }

    pub fn add_session(tmp: &TempDir, session_id: &str) {
        let dir = tmp.path().join("sessions");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{session_id}.json")), "{}").unwrap();
    }

    pub async fn hub_state(tmp: &TempDir, config: HubConfig, with_brain: bool) -> HubState {
        hub_state_with_bus(tmp, config, BusConfig::default(), with_brain).await
    }

    pub async fn hub_state_with_bus(
        tmp: &TempDir,
        config: HubConfig,
        bus_config: BusConfig,
        with_brain: bool,
    ) -> HubState {
        let bus = MessageBus::open(tmp.path().join("bus"), bus_config)
            .await
            .unwrap();
        let sessions = SessionFiles::new(tmp.path().join("sessions"));
        HubState::new(
            config,
            Arc::new(bus),
            Arc::new(sessions),
            with_brain.then(|| BoxBrain::new(ScriptedBrain)),
        )
    }
}
