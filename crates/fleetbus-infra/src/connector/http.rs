//! Hub transport over the HTTP API.

use std::time::Duration;

use fleetbus_core::transport::Transport;
use fleetbus_types::agent::HubStatus;
use fleetbus_types::connector::{Outbound, TransportKind};
use fleetbus_types::error::{BusError, TransportError};
use fleetbus_types::hub::{
    AskPmRequest, HeartbeatRequest, RegisterRequest, RegisterResponse, TaskCompleteRequest,
};
use reqwest::Url;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::file_bus::FileBusTransport;

/// Talks to a running hub.
///
/// Raw envelopes have no HTTP endpoint; they are appended to the bus the hub
/// reads, so the PM still receives them.
#[derive(Clone)]
pub struct HubTransport {
    client: reqwest::Client,
    base_url: Url,
    envelopes: FileBusTransport,
}

impl HubTransport {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        envelopes: FileBusTransport,
    ) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::Unreachable(format!("invalid hub url '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            envelopes,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                TransportError::Unreachable(format!("hub url '{}' cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<R, TransportError> {
        let url = self.endpoint(segments)?;
        debug!(%method, %url, "hub request");
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unreachable(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }

    async fn post<B: Serialize, R: DeserializeOwned>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> Result<R, TransportError> {
        self.call(reqwest::Method::POST, segments, Some(body)).await
    }

    async fn get<R: DeserializeOwned>(&self, segments: &[&str]) -> Result<R, TransportError> {
        self.call::<(), R>(reqwest::Method::GET, segments, None).await
    }

    pub async fn register(
        &self,
        session_id: &str,
        role: &str,
        capabilities: &[String],
    ) -> Result<RegisterResponse, TransportError> {
        let body = RegisterRequest {
            session_id: Some(session_id.to_string()),
            role: role.to_string(),
            capabilities: capabilities.to_vec(),
        };
        self.post(&["api", "register"], &body).await
    }

    /// Take every message the hub queued for `session_id` while it had no socket.
    pub async fn pull_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<serde_json::Value>, TransportError> {
        let body: serde_json::Value = self.get(&["api", "messages", session_id]).await?;
        let messages = body
            .get("messages")
            .and_then(|m| m.as_array())
            .ok_or_else(|| TransportError::InvalidResponse("missing 'messages'".to_string()))?;
        Ok(messages
            .iter()
            .map(|queued| queued.get("msg").cloned().unwrap_or_else(|| queued.clone()))
            .collect())
    }

    pub async fn status(&self) -> Result<HubStatus, TransportError> {
        self.get(&["api", "status"]).await
    }
}

impl Transport for HubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(
        &self,
        session_id: &str,
        message: &Outbound,
    ) -> Result<serde_json::Value, TransportError> {
        let session_id = Some(session_id.to_string());
        match message {
            Outbound::Heartbeat { pressure, task_id } => {
                let body = HeartbeatRequest {
                    session_id,
                    role: None,
                    pressure: pressure.clone(),
                    task_id: task_id.clone(),
                };
                self.post(&["api", "heartbeat"], &body).await
            }
            Outbound::AskPm { question, context } => {
                let body = AskPmRequest {
                    session_id,
                    question: question.clone(),
                    context: context.clone(),
                };
                self.post(&["api", "ask-pm"], &body).await
            }
            Outbound::TaskComplete { task_id, result } => {
                let body = TaskCompleteRequest {
                    session_id,
                    result: result.clone(),
                };
                self.post(&["api", "tasks", task_id.as_str(), "complete"], &body)
                    .await
            }
            Outbound::Envelope(_) => {
                let from = session_id.as_deref().unwrap_or_default();
                let envelope = self.envelopes.append(from, message).await?;
                Ok(serde_json::to_value(&envelope).map_err(BusError::from)?)
            }
        }
    }

    async fn close(&self) {
        debug!(hub = %self.base_url, "closing hub transport");
    }
}

impl std::fmt::Debug for HubTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubTransport")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::bus::MessageBus;
    use fleetbus_types::config::BusConfig;
    use tempfile::TempDir;

    async fn hub(tmp: &TempDir, url: &str) -> HubTransport {
        let bus = Arc::new(
            MessageBus::open(tmp.path().join("bus"), BusConfig::default())
                .await
                .unwrap(),
        );
        HubTransport::new(url, Duration::from_millis(500), FileBusTransport::new(bus)).unwrap()
    }

    #[tokio::test]
    async fn task_ids_are_percent_encoded() {
        let tmp = TempDir::new().unwrap();
        let hub = hub(&tmp, "http://127.0.0.1:3847").await;
        let url = hub.endpoint(&["api", "tasks", "T 1/x", "complete"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:3847/api/tasks/T%201%2Fx/complete");
    }

    #[tokio::test]
    async fn refused_connection_is_transient() {
        let tmp = TempDir::new().unwrap();
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let hub = hub(&tmp, &format!("http://127.0.0.1:{port}")).await;

        let err = hub.register("S-1", "worker", &[]).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn bad_url_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let bus = MessageBus::open(tmp.path(), BusConfig::default()).await.unwrap();
        let err = HubTransport::new(
            "not a url",
            Duration::from_secs(1),
            FileBusTransport::new(Arc::new(bus)),
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
