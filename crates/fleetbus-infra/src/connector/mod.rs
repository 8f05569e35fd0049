//! Agent-side connector.
//!
//! Prefers the hub's HTTP API and falls back to writing the shared bus when
//! the hub cannot be reached. Every (re)connect reconciles: messages that
//! landed on the bus, or in the hub's pending queue, while this agent was away
//! are handed to the registered handlers.

pub mod file_bus;
pub mod http;
pub mod push;

use std::sync::Arc;
use std::time::Duration;

use fleetbus_core::session::validate_session_id;
use fleetbus_core::transport::BoxTransport;
use fleetbus_types::config::ConnectorConfig;
use fleetbus_types::connector::{
    ConnectOutcome, ConnectionState, Inbound, Outbound, SendReport, TransportKind,
};
use fleetbus_types::error::{ConnectorError, TransportError};
use fleetbus_types::hub::ClientFrame;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bus::MessageBus;
use crate::filesystem::HubStateStore;
pub use file_bus::FileBusTransport;
pub use http::HubTransport;
pub use push::PushChannel;

/// Callback for pushed and reconciled messages.
pub type MessageHandler = Arc<dyn Fn(&Inbound) + Send + Sync>;

/// Shared list of message handlers.
#[derive(Clone, Default)]
pub struct Handlers(Arc<RwLock<Vec<MessageHandler>>>);

impl Handlers {
    pub async fn add(&self, handler: MessageHandler) {
        self.0.write().await.push(handler);
    }

    pub async fn dispatch(&self, inbound: &Inbound) {
        for handler in self.0.read().await.iter() {
            handler(inbound);
        }
    }

    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }
}

/// Hub URL from config, else from a running hub's state file.
pub async fn discover_hub_url(config: &ConnectorConfig, state: &HubStateStore) -> Option<String> {
    if let Some(url) = &config.hub_url {
        return Some(url.clone());
    }
    state
        .read()
        .await
        .map(|s| format!("http://127.0.0.1:{}", s.port))
}

struct Link {
    transport: BoxTransport,
    hub: Option<HubTransport>,
    push: Option<PushChannel>,
}

impl Link {
    async fn close(self) {
        self.transport.close().await;
        if let Some(push) = self.push {
            push.close().await;
        }
    }
}

struct Inner {
    state: ConnectionState,
    link: Option<Link>,
    closed: bool,
}

/// One agent's connection to the fleet.
pub struct Connector {
    session_id: String,
    role: String,
    capabilities: Vec<String>,
    hub_url: Option<String>,
    config: ConnectorConfig,
    bus: Arc<MessageBus>,
    handlers: Handlers,
    inner: Mutex<Inner>,
}

impl Connector {
    pub fn new(
        session_id: impl Into<String>,
        role: impl Into<String>,
        bus: Arc<MessageBus>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            role: role.into(),
            capabilities: Vec::new(),
            hub_url: config.hub_url.clone(),
            config,
            bus,
            handlers: Handlers::default(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                link: None,
                closed: false,
            }),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_hub_url(mut self, hub_url: Option<String>) -> Self {
        self.hub_url = hub_url;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Register a handler for pushed and reconciled messages.
    pub async fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Inbound) + Send + Sync + 'static,
    {
        self.handlers.add(Arc::new(handler)).await;
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    fn file_bus_link(&self) -> Link {
        Link {
            transport: BoxTransport::new(FileBusTransport::new(self.bus.clone())),
            hub: None,
            push: None,
        }
    }

    /// Register with the hub, or fall back to the file bus, then reconcile.
    ///
    /// An unreachable or rejecting hub is not an error: the connector comes up
    /// on the file bus and reports `connected: false`.
    pub async fn connect(&self) -> Result<ConnectOutcome, ConnectorError> {
        validate_session_id(&self.session_id)?;

        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.link.take() {
            previous.close().await;
        }
        inner.state = ConnectionState::Connecting;
        inner.closed = false;

        let link = match self.open_hub().await {
            Ok(link) => link,
            Err(err) => {
                warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "hub unavailable; falling back to file bus"
                );
                self.file_bus_link()
            }
        };
        let via = link.transport.kind();
        let hub = link.hub.clone();
        inner.state = ConnectionState::Connected(via);
        inner.link = Some(link);
        drop(inner);

        let mut reconciled = self.reconcile_file_bus_messages().await?;
        if let Some(hub) = hub {
            reconciled += self.pull_hub_queue(&hub).await;
        }

        info!(session_id = %self.session_id, %via, reconciled, "connector up");
        Ok(ConnectOutcome {
            connected: via == TransportKind::Http,
            via,
            fallback: (via == TransportKind::FileBus).then_some(TransportKind::FileBus),
            reconciled,
        })
    }

    async fn open_hub(&self) -> Result<Link, TransportError> {
        let url = self
            .hub_url
            .as_deref()
            .ok_or_else(|| TransportError::Unreachable("no hub url known".to_string()))?;
        let hub = HubTransport::new(url, self.timeout(), FileBusTransport::new(self.bus.clone()))?;
        let registered = hub
            .register(&self.session_id, &self.role, &self.capabilities)
            .await?;
        debug!(
            session_id = %self.session_id,
            agents_count = registered.agents_count,
            "registered with hub"
        );

        let push = if self.config.enable_push {
            let frame = ClientFrame::Register {
                session_id: Some(self.session_id.clone()),
                role: self.role.clone(),
                capabilities: self.capabilities.clone(),
            };
            match PushChannel::open(hub.base_url(), &frame, self.handlers.clone(), self.timeout())
                .await
            {
                Ok(channel) => Some(channel),
                Err(err) => {
                    warn!(error = %err, "push channel unavailable; continuing over HTTP only");
                    None
                }
            }
        } else {
            None
        };

        Ok(Link {
            transport: BoxTransport::new(hub.clone()),
            hub: Some(hub),
            push,
        })
    }

    /// Send over the active transport.
    ///
    /// If the hub has gone away the connector drops to the file bus and sends
    /// there instead; the report names the transport that carried the message.
    pub async fn send(&self, message: Outbound) -> Result<SendReport, ConnectorError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(ConnectorError::Disconnected);
        }
        let Some(link) = inner.link.as_ref() else {
            return Err(ConnectorError::NotConnected);
        };

        let via = link.transport.kind();
        let result = link.transport.send(&self.session_id, &message).await;
        let err = match result {
            Ok(response) => {
                return Ok(SendReport {
                    sent: true,
                    via,
                    response: Some(response),
                });
            }
            Err(err) if err.is_transient() && via == TransportKind::Http => err,
            Err(err) => return Err(err.into()),
        };

        warn!(
            session_id = %self.session_id,
            kind = message.name(),
            error = %err,
            "hub send failed; demoting to file bus"
        );
        let fallback = self.file_bus_link();
        let response = fallback.transport.send(&self.session_id, &message).await?;
        if let Some(previous) = inner.link.replace(fallback) {
            previous.close().await;
        }
        inner.state = ConnectionState::Connected(TransportKind::FileBus);

        Ok(SendReport {
            sent: true,
            via: TransportKind::FileBus,
            response: Some(response),
        })
    }

    /// Tear down the active transport. Later sends fail until `connect()`.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.state = ConnectionState::Disconnected;
        if let Some(link) = inner.link.take() {
            link.close().await;
        }
        info!(session_id = %self.session_id, "connector disconnected");
    }

    /// Deliver every bus message for this agent past its cursor, then ack them.
    pub async fn reconcile_file_bus_messages(&self) -> Result<usize, ConnectorError> {
        let cursor = self.bus.load_cursor(&self.session_id).await?;
        if cursor.recovered {
            warn!(session_id = %self.session_id, "reconciling from a recovered cursor");
        }
        let batch = self.bus.read(&cursor).await?;
        for envelope in &batch.messages {
            self.handlers.dispatch(&Inbound::Bus(envelope.clone())).await;
        }
        self.bus.ack(&batch.cursor, &batch.ids()).await?;

        if !batch.messages.is_empty() {
            info!(
                session_id = %self.session_id,
                count = batch.messages.len(),
                "reconciled bus messages"
            );
        }
        Ok(batch.messages.len())
    }

    async fn pull_hub_queue(&self, hub: &HubTransport) -> usize {
        match hub.pull_messages(&self.session_id).await {
            Ok(messages) => {
                for message in &messages {
                    self.handlers.dispatch(&Inbound::Push(message.clone())).await;
                }
                messages.len()
            }
            Err(err) => {
                warn!(error = %err, "could not pull queued hub messages");
                0
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("hub_url", &self.hub_url)
            .finish()
    }
}
