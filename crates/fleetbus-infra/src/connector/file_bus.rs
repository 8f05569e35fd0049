//! File-bus transport: every outbound message becomes a bus envelope.

use std::sync::Arc;

use fleetbus_core::transport::Transport;
use fleetbus_types::connector::{Outbound, TransportKind};
use fleetbus_types::envelope::{Envelope, EnvelopeDraft, MessageKind, PM, Priority};
use fleetbus_types::error::{BusError, TransportError};
use serde_json::json;

use crate::bus::MessageBus;

pub const HEARTBEAT_TOPIC: &str = "agent.heartbeat";
pub const TASK_COMPLETE_TOPIC: &str = "agent.task_complete";

/// Writes straight to the shared bus; used when the hub is unreachable.
#[derive(Clone)]
pub struct FileBusTransport {
    bus: Arc<MessageBus>,
}

impl FileBusTransport {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    /// Append `message` as an envelope from `session_id`.
    pub async fn append(
        &self,
        session_id: &str,
        message: &Outbound,
    ) -> Result<Envelope, BusError> {
        let draft = match message {
            Outbound::Heartbeat { pressure, task_id } => EnvelopeDraft::new(
                MessageKind::Heartbeat,
                session_id,
                PM,
                HEARTBEAT_TOPIC,
                json!({ "pressure": pressure, "taskId": task_id }),
            )
            .with_priority(Priority::Fyi),
            Outbound::AskPm { question, context } => {
                return self
                    .bus
                    .send_ask_pm(session_id, question, context.clone())
                    .await;
            }
            Outbound::TaskComplete { task_id, result } => EnvelopeDraft::new(
                MessageKind::TaskComplete,
                session_id,
                PM,
                TASK_COMPLETE_TOPIC,
                json!({ "taskId": task_id, "result": result }),
            ),
            Outbound::Envelope(draft) => EnvelopeDraft {
                from: session_id.to_string(),
                ..draft.clone()
            },
        };
        self.bus.append(draft).await
    }
}

impl Transport for FileBusTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::FileBus
    }

    async fn send(
        &self,
        session_id: &str,
        message: &Outbound,
    ) -> Result<serde_json::Value, TransportError> {
        let envelope = self.append(session_id, message).await?;
        Ok(serde_json::to_value(&envelope).map_err(BusError::from)?)
    }

    async fn close(&self) {}
}

impl std::fmt::Debug for FileBusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBusTransport")
            .field("root", &self.bus.paths().root)
            .finish()
    }
}
