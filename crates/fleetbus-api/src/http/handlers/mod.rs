//! Route handlers.

pub mod agent;
pub mod status;
