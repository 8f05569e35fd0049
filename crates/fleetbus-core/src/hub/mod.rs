//! In-memory hub state: agent registry, push delivery, and admission control.

pub mod pending;
pub mod rate_limit;
pub mod registry;

pub use pending::{PendingQueue, QueuedMessage};
pub use rate_limit::RateLimiter;
pub use registry::{AgentRegistry, HeartbeatUpdate, LinkId};
