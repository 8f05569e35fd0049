//! The hub's agent registry and push-delivery table.
//!
//! Agent records live in a `DashMap`. Live WebSocket links and the pending
//! queues share one mutex so that flushing a queue on connect and pushing a
//! new message can never interleave: a message is either queued before the
//! flush (and flushed) or pushed after it (straight to the link).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleetbus_types::agent::{AgentRecord, AgentStatus};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::pending::{DEFAULT_PENDING_CAPACITY, PendingQueue, QueuedMessage};

/// Buffer size for each connection's outbound channel.
pub const LINK_BUFFER: usize = 256;

/// Identifies one WebSocket association, so a late close of an old socket
/// cannot detach a newer one for the same session.
pub type LinkId = u64;

struct Link {
    id: LinkId,
    /// Outbound text frames for the connection's writer.
    tx: mpsc::Sender<String>,
}

/// Push routing, kept under one lock so attaching a link and flushing the
/// backlog cannot race a concurrent send.
#[derive(Default)]
struct Delivery {
    /// Live WebSocket link per session.
    links: HashMap<String, Link>,
    /// Messages queued for sessions without a usable link.
    pending: HashMap<String, PendingQueue>,
}

/// Heartbeat fields an agent may report. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatUpdate {
    pub role: Option<String>,
    /// Free-form load report from the agent.
    pub pressure: Option<serde_json::Value>,
    /// Task the agent is working on.
    pub task_id: Option<String>,
}

pub struct AgentRegistry {
    agents: DashMap<String, AgentRecord>,
    delivery: Mutex<Delivery>,
    next_link: AtomicU64,
    pending_capacity: usize,
}

impl AgentRegistry {
    pub fn new(pending_capacity: usize) -> Self {
        Self {
            agents: DashMap::new(),
            delivery: Mutex::new(Delivery::default()),
            next_link: AtomicU64::new(1),
            pending_capacity,
        }
    }

    fn delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or refresh an agent record.
    pub fn register(
        &self,
        session_id: &str,
        role: &str,
        capabilities: Vec<String>,
        now: DateTime<Utc>,
    ) -> AgentRecord {
        let mut entry = self
            .agents
            .entry(session_id.to_owned())
            .or_insert_with(|| AgentRecord::new(session_id, role, Vec::new(), now));
        let record = entry.value_mut();
        if !role.is_empty() {
            record.role = role.to_owned();
        }
        if !capabilities.is_empty() {
            record.capabilities = capabilities;
        }
        record.last_heartbeat = now;
        debug!(session_id, role = %record.role, "agent registered");
        record.clone()
    }

    /// Apply a heartbeat. Returns `true` when the session was unknown and a
    /// record was created for it.
    pub fn heartbeat(&self, session_id: &str, update: HeartbeatUpdate, now: DateTime<Utc>) -> bool {
        let mut created = false;
        let mut entry = self.agents.entry(session_id.to_owned()).or_insert_with(|| {
            created = true;
            AgentRecord::new(session_id, "", Vec::new(), now)
        });
        let record = entry.value_mut();
        record.last_heartbeat = now;
        if let Some(role) = update.role.filter(|r| !r.is_empty()) {
            record.role = role;
        }
        if update.pressure.is_some() {
            record.pressure = update.pressure;
        }
        if update.task_id.is_some() {
            record.task_id = update.task_id;
        }
        created
    }

    /// Clear the agent's current task. Returns the task it held, if any.
    pub fn complete_task(&self, session_id: &str) -> Option<String> {
        self.agents
            .get_mut(session_id)
            .and_then(|mut record| record.task_id.take())
    }

    pub fn get(&self, session_id: &str) -> Option<AgentRecord> {
        self.agents.get(session_id).map(|r| r.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.agents.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Delete an agent along with its link and queued messages.
    pub fn remove(&self, session_id: &str) -> Option<AgentRecord> {
        let mut delivery = self.delivery();
        delivery.links.remove(session_id);
        delivery.pending.remove(session_id);
        drop(delivery);
        self.agents.remove(session_id).map(|(_, record)| record)
    }

    /// Status rows for every agent, ordered by session id.
    pub fn statuses(&self, now: DateTime<Utc>, stale_after_ms: u64) -> Vec<AgentStatus> {
        let delivery = self.delivery();
        let mut rows: Vec<AgentStatus> = self
            .agents
            .iter()
            .map(|entry| {
                let r = entry.value();
                AgentStatus {
                    session_id: r.session_id.clone(),
                    role: r.role.clone(),
                    capabilities: r.capabilities.clone(),
                    task_id: r.task_id.clone(),
                    registered_at: r.registered_at,
                    last_heartbeat: r.last_heartbeat,
                    heartbeat_age_ms: r.heartbeat_age_ms(now),
                    pressure: r.pressure.clone(),
                    stale: r.is_stale(now, stale_after_ms),
                    ws_connected: delivery.links.contains_key(&r.session_id),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        rows
    }

    /// Remove every agent whose heartbeat is older than `max_age_ms`.
    ///
    /// Returns `(session_id, heartbeat_age_ms)` for each reaped agent.
    pub fn reap_stale(&self, now: DateTime<Utc>, max_age_ms: u64) -> Vec<(String, u64)> {
        let stale: Vec<(String, u64)> = self
            .agents
            .iter()
            .filter(|entry| entry.value().is_stale(now, max_age_ms))
            .map(|entry| (entry.key().clone(), entry.value().heartbeat_age_ms(now)))
            .collect();
        for (session_id, _) in &stale {
            self.remove(session_id);
        }
        stale
    }

    /// Associate a live connection with `session_id` and flush its queue
    /// into it, oldest first.
    ///
    /// Returns the link id and how many queued messages were flushed.
    pub fn attach(&self, session_id: &str, tx: mpsc::Sender<String>) -> (LinkId, usize) {
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let mut delivery = self.delivery();

        let queued = delivery
            .pending
            .get_mut(session_id)
            .map(PendingQueue::drain)
            .unwrap_or_default();

        let mut flushed = 0;
        let mut unsent = Vec::new();
        for item in queued {
            if unsent.is_empty() && tx.try_send(item.msg.to_string()).is_ok() {
                flushed += 1;
            } else {
                unsent.push(item);
            }
        }
        if !unsent.is_empty() {
            warn!(session_id, count = unsent.len(), "connection refused queued messages; requeued");
            let queue = delivery
                .pending
                .entry(session_id.to_owned())
                .or_insert_with(|| PendingQueue::new(self.pending_capacity));
            for item in unsent {
                queue.push(item.msg, item.queued_at);
            }
        }

        delivery.links.insert(session_id.to_owned(), Link { id, tx });
        (id, flushed)
    }

    /// Drop the association if it is still `link_id`. Returns whether it was.
    pub fn detach(&self, session_id: &str, link_id: LinkId) -> bool {
        let mut delivery = self.delivery();
        match delivery.links.get(session_id) {
            Some(link) if link.id == link_id => {
                delivery.links.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.delivery().links.contains_key(session_id)
    }

    pub fn connected_count(&self) -> usize {
        self.delivery().links.len()
    }

    /// Push `msg` over the agent's live connection, or queue it.
    ///
    /// Returns `true` only when the message was handed to a live connection.
    pub fn send_to_agent(&self, session_id: &str, msg: &serde_json::Value) -> bool {
        let mut delivery = self.delivery();

        if let Some(link) = delivery.links.get(session_id) {
            match link.tx.try_send(msg.to_string()) {
                Ok(()) => return true,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(session_id, "link closed; dropping association");
                    delivery.links.remove(session_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id, "link buffer full; queueing message");
                }
            }
        }

        let dropped = delivery
            .pending
            .entry(session_id.to_owned())
            .or_insert_with(|| PendingQueue::new(self.pending_capacity))
            .push(msg.clone(), Utc::now());
        if dropped > 0 {
            debug!(session_id, dropped, "pending queue full; dropped oldest");
        }
        false
    }

    /// Push `msg` to every connected agent except `exclude`.
    ///
    /// Agents without a live connection are skipped, not queued.
    pub fn broadcast(&self, msg: &serde_json::Value, exclude: Option<&str>) -> usize {
        let text = msg.to_string();
        let delivery = self.delivery();
        delivery
            .links
            .iter()
            .filter(|(session_id, _)| Some(session_id.as_str()) != exclude)
            .filter(|(_, link)| link.tx.try_send(text.clone()).is_ok())
            .count()
    }

    /// Remove and return the agent's queued messages, oldest first.
    pub fn take_pending(&self, session_id: &str) -> Vec<QueuedMessage> {
        self.delivery()
            .pending
            .remove(session_id)
            .map(|mut queue| queue.drain())
            .unwrap_or_default()
    }

    pub fn pending_len(&self, session_id: &str) -> usize {
        self.delivery()
            .pending
            .get(session_id)
            .map_or(0, PendingQueue::len)
    }

    /// Drop every live link. Connection writers see their channel close.
    pub fn close_all(&self) -> usize {
        let mut delivery = self.delivery();
        let count = delivery.links.len();
        delivery.links.clear();
        count
    }

    /// Forget every agent, link, and queue.
    pub fn clear(&self) {
        let mut delivery = self.delivery();
        delivery.links.clear();
        delivery.pending.clear();
        drop(delivery);
        self.agents.clear();
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.len())
            .field("pending_capacity", &self.pending_capacity)
            .finish()
    }
}
