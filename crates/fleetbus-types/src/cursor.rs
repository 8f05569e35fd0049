//! Per-reader bus cursor.

use serde::{Deserialize, Serialize};

/// Upper bound on remembered processed ids per reader.
pub const MAX_PROCESSED_IDS: usize = 1_000;

/// A reader's saved position in `bus.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub session_id: String,
    /// Number of envelopes this reader has consumed so far.
    #[serde(default)]
    pub last_seq: u64,
    /// Byte position of the first unread line.
    #[serde(default)]
    pub byte_offset: u64,
    /// Compaction generation `byte_offset` refers to.
    #[serde(default)]
    pub generation: u64,
    /// Recently acknowledged message ids, oldest first.
    #[serde(default)]
    pub processed_ids: Vec<String>,
    /// Set when the on-disk cursor was unusable and replaced with defaults.
    #[serde(rename = "_recovered", default, skip_serializing_if = "is_false")]
    pub recovered: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Cursor {
    /// A fresh cursor at the start of the bus.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            last_seq: 0,
            byte_offset: 0,
            generation: 0,
            processed_ids: Vec::new(),
            recovered: false,
        }
    }

    /// Default cursor flagged as recovered from corruption.
    pub fn recovered(session_id: impl Into<String>) -> Self {
        Self {
            recovered: true,
            ..Self::new(session_id)
        }
    }

    pub fn has_processed(&self, id: &str) -> bool {
        self.processed_ids.iter().any(|p| p == id)
    }

    /// Record ids as processed, keeping only the newest [`MAX_PROCESSED_IDS`].
    pub fn remember<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            let id = id.into();
            if !self.has_processed(&id) {
                self.processed_ids.push(id);
            }
        }
        if self.processed_ids.len() > MAX_PROCESSED_IDS {
            let excess = self.processed_ids.len() - MAX_PROCESSED_IDS;
            self.processed_ids.drain(..excess);
        }
    }
}
