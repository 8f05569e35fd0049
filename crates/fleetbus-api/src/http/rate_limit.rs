//! Per-IP admission control for every HTTP request.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::http::error::AppError;
use crate::hub::HubState;

/// Key used when the peer address is unknown (e.g. in-process requests).
pub const UNKNOWN_CLIENT: &str = "unknown";

pub fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Reject with 429 once the client's sliding window is full.
pub async fn rate_limit(State(hub): State<HubState>, request: Request, next: Next) -> Response {
    let key = client_key(&request);
    if !hub.limiter.allow(&key) {
        tracing::warn!(client = %key, path = %request.uri().path(), "rate limited");
        return AppError::RateLimited.into_response();
    }
    next.run(request).await
}
