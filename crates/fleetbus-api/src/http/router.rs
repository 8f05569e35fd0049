//! Axum router configuration with middleware.
//!
//! Every route, including the 404 fallback, sits behind the per-IP rate
//! limiter. Requests are traced with `TraceLayer`.

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::http::error::AppError;
use crate::http::handlers::{agent, status};
use crate::http::rate_limit::rate_limit;
use crate::http::ws;
use crate::hub::HubState;

/// Build the hub router.
pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/api/register", post(agent::register))
        .route("/api/heartbeat", post(agent::heartbeat))
        .route("/api/ask-pm", post(agent::ask_pm))
        .route("/api/tasks/{task_id}/complete", post(agent::complete_task))
        .route("/api/messages/{session_id}", get(agent::pull_messages))
        .route("/api/status", get(status::status))
        .route("/api/connect", get(ws::connect))
        .route("/health", get(status::health))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> AppError {
    AppError::NotFound
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use fleetbus_types::config::HubConfig;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::hub::state::test_support::{add_session, hub_state};

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn register_validates_the_session() {
        let tmp = TempDir::new().unwrap();
        add_session(&tmp, "S-1");
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let router = build_router(state.clone());

        let (status, body) = send(&router, post_json("/api/register", json!({"role": "w"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "sessionId required");

        let (status, body) = send(
            &router,
            post_json("/api/register", json!({"sessionId": "../../../etc/passwd"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Invalid session");

        let (status, _) = send(&router, post_json("/api/register", json!({"sessionId": "S-404"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(state.registry.is_empty());

        let (status, body) = send(
            &router,
            post_json(
                "/api/register",
                json!({"sessionId": "S-1", "role": "frontend", "capabilities": ["react"]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"connected": true, "agents_count": 1}));

        let audit = state.bus.scan().await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].topic, "hub.agent_registered");
        assert_eq!(audit[0].payload["via"], "http");
    }

    #[tokio::test]
    async fn heartbeat_auto_registers_unknown_agents() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let router = build_router(state.clone());

        let (status, body) = send(
            &router,
            post_json(
                "/api/heartbeat",
                json!({"sessionId": "S-7", "pressure": 0.8, "taskId": "T-3"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["autoRegistered"], true);

        let record = state.registry.get("S-7").unwrap();
        assert_eq!(record.task_id.as_deref(), Some("T-3"));
        assert_eq!(record.pressure, Some(json!(0.8)));

        let (_, body) = send(&router, post_json("/api/heartbeat", json!({"sessionId": "S-7"}))).await;
        assert_eq!(body["autoRegistered"], false);

        let topics: Vec<String> = state
            .bus
            .scan()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.topic)
            .collect();
        assert_eq!(topics, vec!["hub.agent_auto_registered"]);

        let (status, _) = send(&router, post_json("/api/heartbeat", json!({"sessionId": "a/b"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn ask_pm_needs_a_brain() {
        let tmp = TempDir::new().unwrap();
        let without = build_router(hub_state(&tmp, HubConfig::default(), false).await);
        let question = json!({"sessionId": "S-1", "question": "ship it?"});

        let (status, body) = send(&without, post_json("/api/ask-pm", question.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Brain not available");

        let tmp = TempDir::new().unwrap();
        let with = build_router(hub_state(&tmp, HubConfig::default(), true).await);
        let (status, body) = send(&with, post_json("/api/ask-pm", question)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["guidance"], "S-1: proceed with 'ship it?'");
        assert_eq!(body["confidence"], "high");
    }

    #[tokio::test]
    async fn task_completion_clears_task_and_audits() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let router = build_router(state.clone());
        send(&router, post_json("/api/heartbeat", json!({"sessionId": "S-1", "taskId": "T-9"}))).await;

        let mut events = state.events.subscribe();
        let (status, body) = send(
            &router,
            post_json("/api/tasks/T-9/complete", json!({"sessionId": "S-1", "result": {"ok": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["taskId"], "T-9");
        assert_eq!(state.registry.get("S-1").unwrap().task_id, None);

        let event = events.recv().await.unwrap();
        assert_eq!(event.name(), "task_complete");
        let last = state.bus.scan().await.unwrap().pop().unwrap();
        assert_eq!(last.topic, "hub.task_complete");
        assert_eq!(last.payload["task_id"], "T-9");
    }

    #[tokio::test]
    async fn queued_messages_are_pulled_once() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let router = build_router(state.clone());

        assert!(!state.registry.send_to_agent("S-1", &json!({"n": 1})));
        assert!(!state.registry.send_to_agent("S-1", &json!({"n": 2})));

        let (status, body) = send(&router, get("/api/messages/S-1")).await;
        assert_eq!(status, StatusCode::OK);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["msg"]["n"], 1);
        assert_eq!(messages[1]["msg"]["n"], 2);

        let (_, body) = send(&router, get("/api/messages/S-1")).await;
        assert!(body["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_queue_keeps_newest_hundred() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let router = build_router(state.clone());
        for n in 0..105 {
            state.registry.send_to_agent("S-1", &json!({"n": n}));
        }

        let (_, body) = send(&router, get("/api/messages/S-1")).await;
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 100);
        assert_eq!(messages[0]["msg"]["n"], 5);
        assert_eq!(messages[99]["msg"]["n"], 104);
    }

    #[tokio::test]
    async fn message_pull_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let router = build_router(hub_state(&tmp, HubConfig::default(), false).await);
        let (status, body) = send(&router, get("/api/messages/..%2F..%2Fetc")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Invalid session");
    }

    #[tokio::test]
    async fn status_marks_stale_agents() {
        let tmp = TempDir::new().unwrap();
        let config = HubConfig {
            heartbeat_stale_ms: 60_000,
            ..HubConfig::default()
        };
        let state = hub_state(&tmp, config, false).await;
        let router = build_router(state.clone());
        state
            .registry
            .register("S-old", "w", vec![], Utc::now() - chrono::Duration::seconds(120));
        state.registry.register("S-new", "w", vec![], Utc::now());

        let (status, body) = send(&router, get("/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected_agents"], 2);
        assert_eq!(body["brain_available"], false);
        let agents = body["agents"].as_array().unwrap();
        let stale = |id: &str| {
            agents
                .iter()
                .find(|a| a["sessionId"] == id)
                .map(|a| (a["stale"].clone(), a["ws_connected"].clone()))
                .unwrap()
        };
        assert_eq!(stale("S-old"), (json!(true), json!(false)));
        assert_eq!(stale("S-new"), (json!(false), json!(false)));
    }

    #[tokio::test]
    async fn rate_limit_applies_to_every_path() {
        let tmp = TempDir::new().unwrap();
        let config = HubConfig {
            rate_limit_max: 2,
            ..HubConfig::default()
        };
        let router = build_router(hub_state(&tmp, config, false).await);

        assert_eq!(send(&router, get("/health")).await.0, StatusCode::OK);
        assert_eq!(send(&router, get("/nowhere")).await.0, StatusCode::NOT_FOUND);
        let (status, body) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn unknown_paths_are_404_json() {
        let tmp = TempDir::new().unwrap();
        let router = build_router(hub_state(&tmp, HubConfig::default(), false).await);
        let (status, body) = send(&router, get("/api/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Not found"}));

        let (status, body) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn connect_without_upgrade_headers_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let router = build_router(hub_state(&tmp, HubConfig::default(), false).await);
        let (status, body) = send(&router, get("/api/connect")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("upgrade"));
    }
}
