//! Agent-facing endpoints: register, heartbeat, ask-PM, task completion, and
//! pulling queued messages.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use chrono::Utc;
use fleetbus_core::hub::HeartbeatUpdate;
use fleetbus_core::session::{check_session, validate_session_id};
use fleetbus_types::error::BrainError;
use fleetbus_types::event::{HubEvent, Via};
use fleetbus_types::hub::{
    AskPmRequest, HeartbeatRequest, PmAnswer, RegisterRequest, RegisterResponse,
    TaskCompleteRequest,
};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::http::error::AppError;
use crate::hub::HubState;

/// POST /api/register
pub async fn register(
    State(hub): State<HubState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, AppError> {
    let Json(body) = payload?;
    let session_id = body.session_id.unwrap_or_default();
    check_session(hub.sessions.as_ref(), &session_id)?;

    let record = hub
        .registry
        .register(&session_id, &body.role, body.capabilities, Utc::now());
    info!(session_id = %session_id, role = %record.role, "agent registered over HTTP");
    hub.record(HubEvent::AgentRegistered {
        session_id,
        role: record.role,
        via: Via::Http,
    })
    .await;

    Ok(Json(RegisterResponse {
        connected: true,
        agents_count: hub.registry.len(),
    }))
}

/// POST /api/heartbeat
///
/// An unknown session is registered on the spot instead of being refused.
pub async fn heartbeat(
    State(hub): State<HubState>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = payload?;
    let session_id = body.session_id.unwrap_or_default();
    validate_session_id(&session_id)?;

    let update = HeartbeatUpdate {
        role: body.role,
        pressure: body.pressure,
        task_id: body.task_id,
    };
    let created = hub.registry.heartbeat(&session_id, update, Utc::now());
    if created {
        info!(session_id = %session_id, "heartbeat from unknown agent; auto-registered");
        hub.record(HubEvent::AgentAutoRegistered {
            session_id,
            via: Via::Http,
        })
        .await;
    }

    Ok(Json(json!({ "ok": true, "autoRegistered": created })))
}

/// POST /api/ask-pm
pub async fn ask_pm(
    State(hub): State<HubState>,
    payload: Result<Json<AskPmRequest>, JsonRejection>,
) -> Result<Json<PmAnswer>, AppError> {
    let Json(body) = payload?;
    let brain = hub.brain.as_ref().ok_or(BrainError::Unavailable)?;
    let session_id = body.session_id.unwrap_or_default();
    validate_session_id(&session_id)?;

    debug!(session_id = %session_id, "asking PM");
    let answer = brain.ask(&session_id, &body.question, &body.context).await?;
    Ok(Json(answer))
}

/// POST /api/tasks/{task_id}/complete
pub async fn complete_task(
    State(hub): State<HubState>,
    Path(task_id): Path<String>,
    payload: Result<Json<TaskCompleteRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = payload?;
    let session_id = body.session_id.unwrap_or_default();
    validate_session_id(&session_id)?;

    let held = hub.registry.complete_task(&session_id);
    info!(session_id = %session_id, task_id = %task_id, ?held, "task complete");
    hub.record(HubEvent::TaskComplete {
        session_id,
        task_id: task_id.clone(),
        result: body.result,
        via: Via::Http,
    })
    .await;

    Ok(Json(json!({ "ok": true, "taskId": task_id })))
}

/// GET /api/messages/{session_id}
///
/// Returns the agent's queued messages and empties the queue.
pub async fn pull_messages(
    State(hub): State<HubState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    validate_session_id(&session_id)?;
    let messages = hub.registry.take_pending(&session_id);
    debug!(session_id = %session_id, count = messages.len(), "pending messages pulled");
    Ok(Json(json!({ "messages": messages })))
}
