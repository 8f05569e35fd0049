//! Ask-PM helpers shared by agents and the hub.

use std::collections::HashSet;

use fleetbus_types::envelope::{Envelope, EnvelopeDraft, HUB_SENDER, MessageKind, PM, Priority};
use fleetbus_types::error::BusError;
use fleetbus_types::hub::PmAnswer;
use serde_json::json;

use super::MessageBus;

pub const ASK_PM_TOPIC: &str = "pm.ask";
pub const PM_RESPONSE_TOPIC: &str = "pm.response";

impl MessageBus {
    /// Ask the PM a question through the bus.
    pub async fn send_ask_pm(
        &self,
        from: &str,
        question: &str,
        context: serde_json::Value,
    ) -> Result<Envelope, BusError> {
        self.append(
            EnvelopeDraft::new(
                MessageKind::AskPm,
                from,
                PM,
                ASK_PM_TOPIC,
                json!({ "question": question, "context": context }),
            )
            .with_priority(Priority::Blocking),
        )
        .await
    }

    /// Answer an `ask_pm` message; the answer's fields become the payload.
    pub async fn send_pm_response(
        &self,
        to: &str,
        ask_id: &str,
        answer: &PmAnswer,
    ) -> Result<Envelope, BusError> {
        self.append(
            EnvelopeDraft::new(
                MessageKind::PmResponse,
                HUB_SENDER,
                to,
                PM_RESPONSE_TOPIC,
                serde_json::to_value(answer)?,
            )
            .with_priority(Priority::Blocking)
            .correlated_with(ask_id),
        )
        .await
    }

    /// `ask_pm` messages to the PM that no `pm_response` has answered yet,
    /// in the order they were asked.
    pub async fn unanswered_pm_requests(&self) -> Result<Vec<Envelope>, BusError> {
        let all = self.scan().await?;
        Ok(unanswered_ids(&all)
            .into_iter()
            .filter_map(|id| all.iter().find(|e| e.id == id))
            .cloned()
            .collect())
    }
}

/// Ids of `ask_pm` messages in `log` with no `pm_response` correlated to them.
pub(super) fn unanswered_ids(log: &[Envelope]) -> Vec<&str> {
    let answered: HashSet<&str> = log
        .iter()
        .filter(|e| e.kind == MessageKind::PmResponse)
        .filter_map(|e| e.correlation_id.as_deref())
        .collect();
    log.iter()
        .filter(|e| e.kind == MessageKind::AskPm && e.to == PM)
        .map(|e| e.id.as_str())
        .filter(|id| !answered.contains(id))
        .collect()
}
