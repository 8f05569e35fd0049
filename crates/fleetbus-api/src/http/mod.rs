//! HTTP and WebSocket surface of the hub.
//!
//! JSON routes under `/api/`, the raw-socket upgrade on `/api/connect`, and a
//! per-IP rate limiter in front of everything. Errors are `{error: string}`.

pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod router;
pub mod ws;
