//! Bounded per-agent queue for messages the hub could not push.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default queue capacity per agent.
pub const DEFAULT_PENDING_CAPACITY: usize = 100;

/// A message waiting for its agent to connect or poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub msg: serde_json::Value,
    pub queued_at: DateTime<Utc>,
}

/// FIFO with a hard capacity. Pushing onto a full queue drops the oldest entry.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    capacity: usize,
    items: VecDeque<QueuedMessage>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(DEFAULT_PENDING_CAPACITY)),
        }
    }

    /// Enqueue a message. Returns how many old entries were evicted.
    pub fn push(&mut self, msg: serde_json::Value, now: DateTime<Utc>) -> usize {
        let mut dropped = 0;
        while self.items.len() >= self.capacity {
            self.items.pop_front();
            dropped += 1;
        }
        self.items.push_back(QueuedMessage {
            msg,
            queued_at: now,
        });
        dropped
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = PendingQueue::default();
        let mut dropped = 0;
        for i in 0..105 {
            dropped += queue.push(json!({"i": i}), Utc::now());
        }
        assert_eq!(dropped, 5);
        assert_eq!(queue.len(), 100);

        let items = queue.drain();
        assert_eq!(items[0].msg["i"], 5);
        assert_eq!(items[99].msg["i"], 104);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_preserves_fifo() {
        let mut queue = PendingQueue::new(3);
        queue.push(json!("a"), Utc::now());
        queue.push(json!("b"), Utc::now());
        let items: Vec<_> = queue.drain().into_iter().map(|q| q.msg).collect();
        assert_eq!(items, vec![json!("a"), json!("b")]);
    }
}
