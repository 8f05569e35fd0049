//! BoxTransport -- object-safe dynamic dispatch wrapper for `Transport`.

use std::future::Future;
use std::pin::Pin;

use fleetbus_types::connector::{Outbound, TransportKind};
use fleetbus_types::error::TransportError;

use super::Transport;

/// Object-safe version of [`Transport`] with boxed futures.
pub trait TransportDyn: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn send_boxed<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a Outbound,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TransportError>> + Send + 'a>>;

    fn close_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

impl<T: Transport> TransportDyn for T {
    fn kind(&self) -> TransportKind {
        Transport::kind(self)
    }

    fn send_boxed<'a>(
        &'a self,
        session_id: &'a str,
        message: &'a Outbound,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TransportError>> + Send + 'a>> {
        Box::pin(self.send(session_id, message))
    }

    fn close_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.close())
    }
}

/// Type-erased transport selected at runtime.
pub struct BoxTransport {
    inner: Box<dyn TransportDyn>,
}

impl BoxTransport {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self {
            inner: Box::new(transport),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.inner.kind()
    }

    pub async fn send(
        &self,
        session_id: &str,
        message: &Outbound,
    ) -> Result<serde_json::Value, TransportError> {
        self.inner.send_boxed(session_id, message).await
    }

    pub async fn close(&self) {
        self.inner.close_boxed().await
    }
}

impl std::fmt::Debug for BoxTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTransport")
            .field("kind", &self.inner.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Recording {
        closed: Arc<AtomicBool>,
    }

    impl Transport for Recording {
        fn kind(&self) -> TransportKind {
            TransportKind::FileBus
        }

        async fn send(
            &self,
            session_id: &str,
            message: &Outbound,
        ) -> Result<serde_json::Value, TransportError> {
            Ok(serde_json::json!({"from": session_id, "kind": message.name()}))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn boxed_transport_delegates() {
        let closed = Arc::new(AtomicBool::new(false));
        let transport = BoxTransport::new(Recording {
            closed: closed.clone(),
        });
        assert_eq!(transport.kind(), TransportKind::FileBus);

        let message = Outbound::TaskComplete {
            task_id: "T-1".into(),
            result: serde_json::json!({}),
        };
        let response = transport.send("S-1", &message).await.unwrap();
        assert_eq!(response["kind"], "task_complete");

        transport.close().await;
        assert!(closed.load(Ordering::SeqCst));
    }
}
