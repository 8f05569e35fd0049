//! The PM brain port.
//!
//! The hub does not answer questions itself. An embedding application injects
//! a [`Brain`]; without one, ask-PM requests are refused and reconciliation of
//! unanswered questions is skipped.

pub mod box_brain;

use std::future::Future;

use fleetbus_types::error::BrainError;
use fleetbus_types::hub::PmAnswer;

pub use box_brain::{BoxBrain, BrainDyn};

/// Answers agent questions on behalf of the PM.
pub trait Brain: Send + Sync {
    fn ask(
        &self,
        session_id: &str,
        question: &str,
        context: &serde_json::Value,
    ) -> impl Future<Output = Result<PmAnswer, BrainError>> + Send;
}
