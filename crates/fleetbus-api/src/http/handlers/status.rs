//! Status and liveness.

use axum::Json;
use axum::extract::State;
use fleetbus_types::agent::HubStatus;

use crate::hub::HubState;

/// GET /api/status
pub async fn status(State(hub): State<HubState>) -> Json<HubStatus> {
    Json(hub.status())
}

/// GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
