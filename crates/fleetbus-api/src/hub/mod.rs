//! Hub lifecycle.
//!
//! [`Hub::start`] binds the first free port at or above the configured one,
//! records it in the state file, answers questions left on the bus while no
//! hub was running, and starts the HTTP server plus a maintenance tick.
//! [`Hub::stop`] undoes all of it.

mod maintenance;
pub mod state;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use fleetbus_infra::filesystem::HubStateStore;
use fleetbus_types::error::HubError;
use fleetbus_types::hub::HubStateFile;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::router::build_router;
pub use maintenance::reconcile_pm_requests;
pub use state::{HubShared, HubState};

/// How long `stop()` waits for in-flight requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct Running {
    port: u16,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

/// A hub process: shared state plus the tasks serving it.
pub struct Hub {
    state: HubState,
    state_file: HubStateStore,
    running: Mutex<Option<Running>>,
}

impl Hub {
    pub fn new(state: HubState, state_file: HubStateStore) -> Self {
        Self {
            state,
            state_file,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &HubState {
        &self.state
    }

    pub async fn port(&self) -> Option<u16> {
        self.running.lock().await.as_ref().map(|r| r.port)
    }

    /// Start serving. Calling it again while running returns the same port.
    pub async fn start(&self) -> Result<u16, HubError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            debug!(port = current.port, "hub already running");
            return Ok(current.port);
        }

        let (listener, port) = self.bind().await?;
        self.state.set_listening(Some(port));

        let record = HubStateFile {
            port,
            pid: std::process::id(),
            started_at: Some(Utc::now()),
        };
        if let Err(err) = self.state_file.write(&record).await {
            self.state.set_listening(None);
            return Err(err.into());
        }

        match reconcile_pm_requests(&self.state).await {
            Ok(0) => {}
            Ok(answered) => info!(answered, "answered questions left on the bus"),
            Err(err) => warn!(error = %err, "reconciliation failed"),
        }

        let cancel = CancellationToken::new();
        let app = build_router(self.state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = cancel.clone();
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(error = %err, "hub server failed");
            }
        });
        let maintenance = tokio::spawn(maintenance::run(self.state.clone(), cancel.clone()));

        info!(port, "hub listening");
        *running = Some(Running {
            port,
            cancel,
            server,
            maintenance,
        });
        Ok(port)
    }

    /// Bind `port`, `port + 1`, ... while the port is in use.
    async fn bind(&self) -> Result<(TcpListener, u16), HubError> {
        let config = &self.state.config;
        let attempts = if config.port == 0 {
            1
        } else {
            config.max_port_attempts.max(1)
        };

        for offset in 0..attempts {
            let Some(port) = config.port.checked_add(offset) else {
                break;
            };
            match TcpListener::bind((config.host.as_str(), port)).await {
                Ok(listener) => {
                    let bound = listener.local_addr()?.port();
                    if offset > 0 {
                        info!(requested = config.port, bound, "configured port busy; moved up");
                    }
                    return Ok((listener, bound));
                }
                Err(err) if err.kind() == ErrorKind::AddrInUse => {
                    debug!(port, "port in use");
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(HubError::PortsExhausted {
            start: config.port,
            end: u32::from(config.port) + u32::from(attempts) - 1,
        })
    }

    /// Stop serving: close every socket, forget every agent, remove the
    /// state file. A no-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        let closed = self.state.registry.close_all();
        self.state.registry.clear();
        self.state.set_listening(None);

        if let Err(err) = self.state_file.remove().await {
            warn!(error = %err, "could not remove hub state file");
        }

        if tokio::time::timeout(SHUTDOWN_GRACE, running.server).await.is_err() {
            warn!("hub server did not shut down in time");
        }
        let _ = running.maintenance.await;
        info!(port = running.port, closed, "hub stopped");
    }
}
