//! BoxBrain -- object-safe dynamic dispatch wrapper for `Brain`.

use std::future::Future;
use std::pin::Pin;

use fleetbus_types::error::BrainError;
use fleetbus_types::hub::PmAnswer;

use super::Brain;

/// Object-safe version of [`Brain`] with a boxed future.
pub trait BrainDyn: Send + Sync {
    fn ask_boxed<'a>(
        &'a self,
        session_id: &'a str,
        question: &'a str,
        context: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<PmAnswer, BrainError>> + Send + 'a>>;
}

impl<T: Brain> BrainDyn for T {
    fn ask_boxed<'a>(
        &'a self,
        session_id: &'a str,
        question: &'a str,
        context: &'a serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<PmAnswer, BrainError>> + Send + 'a>> {
        Box::pin(self.ask(session_id, question, context))
    }
}

/// Type-erased brain, so the hub can hold whichever one it was given.
pub struct BoxBrain {
    inner: Box<dyn BrainDyn>,
}

impl BoxBrain {
    pub fn new<T: Brain + 'static>(brain: T) -> Self {
        Self {
            inner: Box::new(brain),
        }
    }

    pub async fn ask(
        &self,
        session_id: &str,
        question: &str,
        context: &serde_json::Value,
    ) -> Result<PmAnswer, BrainError> {
        self.inner.ask_boxed(session_id, question, context).await
    }
}

impl std::fmt::Debug for BoxBrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxBrain").finish_non_exhaustive()
    }
}
