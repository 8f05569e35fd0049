//! Periodic hub upkeep and ask-PM reconciliation.

use std::time::Duration;

use chrono::Utc;
use fleetbus_types::error::BusError;
use fleetbus_types::event::HubEvent;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::HubState;

/// Answer every `ask_pm` on the bus that has no `pm_response` yet.
///
/// Returns how many were answered. Without a brain nothing is answered.
pub async fn reconcile_pm_requests(hub: &HubState) -> Result<usize, BusError> {
    let Some(brain) = hub.brain.as_ref() else {
        debug!("no brain; skipping ask-PM reconciliation");
        return Ok(0);
    };

    let mut answered = 0;
    for ask in hub.bus.unanswered_pm_requests().await? {
        let question = ask
            .payload
            .get("question")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        let context = ask.payload.get("context").cloned().unwrap_or_default();

        match brain.ask(&ask.from, question, &context).await {
            Ok(answer) => {
                hub.bus.send_pm_response(&ask.from, &ask.id, &answer).await?;
                answered += 1;
            }
            Err(err) => warn!(
                message_id = %ask.id,
                session_id = %ask.from,
                error = %err,
                "brain could not answer queued question"
            ),
        }
    }
    Ok(answered)
}

/// Push retried requests again to whoever is linked to receive them.
///
/// Returns how many sockets accepted a copy. Recipients without a live link
/// pick the request up from the bus on their next reconciliation.
async fn redeliver(hub: &HubState, message_ids: &[String]) -> Result<usize, BusError> {
    if message_ids.is_empty() {
        return Ok(0);
    }
    let mut delivered = 0;
    for envelope in hub.bus.scan().await? {
        if !message_ids.contains(&envelope.id) {
            continue;
        }
        let frame = serde_json::to_value(&envelope)?;
        if envelope.is_broadcast() {
            delivered += hub.registry.broadcast(&frame, Some(&envelope.from));
        } else if hub.registry.send_to_agent(&envelope.to, &frame) {
            delivered += 1;
        }
        debug!(message_id = %envelope.id, to = %envelope.to, "re-sent unacknowledged request");
    }
    Ok(delivered)
}

/// One maintenance pass: reap stale agents, expire rate-limit entries,
/// sweep ACK deadlines, answer new questions, then compact the bus when due.
///
/// Questions are answered before compaction so the answers land on the bus
/// before the PM's backlog is judged.
pub(crate) async fn tick(hub: &HubState) {
    let max_age = hub.config.heartbeat_stale_ms.saturating_mul(2);
    for (session_id, heartbeat_age_ms) in hub.registry.reap_stale(Utc::now(), max_age) {
        info!(session_id = %session_id, heartbeat_age_ms, "reaped stale agent");
        hub.record(HubEvent::AgentReaped {
            session_id,
            heartbeat_age_ms,
        })
        .await;
    }

    hub.limiter.cleanup();

    match hub.bus.process_ack_timeouts().await {
        Ok(sweep) if sweep.retried > 0 || sweep.dlqd > 0 => {
            info!(retried = sweep.retried, dlqd = sweep.dlqd, "ack sweep");
            match redeliver(hub, &sweep.retried_ids).await {
                Ok(pushed) => debug!(pushed, "re-sent retried requests"),
                Err(err) => warn!(error = %err, "re-sending retried requests failed"),
            }
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "ack sweep failed"),
    }

    if let Err(err) = reconcile_pm_requests(hub).await {
        warn!(error = %err, "ask-PM reconciliation failed");
    }

    match hub.bus.needs_compaction().await {
        Ok(true) => {
            if let Err(err) = hub.bus.compact_bus().await {
                warn!(error = %err, "compaction failed");
            }
        }
        Ok(false) => {}
        Err(err) => warn!(error = %err, "cannot size bus"),
    }
}

pub(crate) async fn run(hub: HubState, cancel: CancellationToken) {
    let period = Duration::from_millis(hub.config.reaper_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    // The first tick fires immediately; start() has just reconciled.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => tick(&hub).await,
        }
    }
    debug!("maintenance stopped");
}
