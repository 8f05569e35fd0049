//! WebSocket push channel from the hub.
//!
//! The connector opens `/api/connect`, registers, and then only listens: the
//! hub pushes frames here, outbound traffic still goes over HTTP.

use std::time::Duration;

use fleetbus_core::wire::handshake::{client_request, generate_key, generate_mask, verify_response};
use fleetbus_core::wire::{FrameDecoder, Message, Opcode, encode_frame, encode_masked_text};
use fleetbus_types::connector::Inbound;
use fleetbus_types::error::{TransportError, WireError};
use fleetbus_types::hub::ClientFrame;
use reqwest::Url;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Handlers;

pub const CONNECT_PATH: &str = "/api/connect";
const MAX_HANDSHAKE_BYTES: usize = 8 * 1024;
const READ_CHUNK: usize = 4 * 1024;
const NORMAL_CLOSURE: u16 = 1000;

/// A running push listener. Dropping it does not stop the task; call
/// [`PushChannel::close`].
#[derive(Debug)]
pub struct PushChannel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PushChannel {
    /// Open the socket, register, and start delivering pushed frames.
    pub async fn open(
        base_url: &Url,
        register: &ClientFrame,
        handlers: Handlers,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let host = base_url
            .host_str()
            .ok_or_else(|| TransportError::Unreachable(format!("hub url '{base_url}' has no host")))?
            .to_string();
        let port = base_url.port_or_known_default().unwrap_or(80);

        let mut stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| TransportError::Unreachable(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| TransportError::Unreachable(format!("connect to {host}:{port}: {e}")))?;

        let key = generate_key();
        let request = client_request(&format!("{host}:{port}"), CONNECT_PATH, &key);
        stream.write_all(request.as_bytes()).await.map_err(WireError::from)?;

        let leftover = tokio::time::timeout(timeout, read_handshake(&mut stream, &key))
            .await
            .map_err(|_| WireError::Handshake("handshake timed out".to_string()))??;

        let frame = serde_json::to_string(register)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        stream
            .write_all(&encode_masked_text(&frame, generate_mask()))
            .await
            .map_err(WireError::from)?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(stream, leftover, handlers, cancel.clone()));
        info!(hub = %base_url, "push channel open");
        Ok(Self { cancel, task })
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Send a close frame and wait for the listener to stop.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "push listener ended abnormally");
        }
    }
}

/// Read the response head and verify it; returns bytes read past the head.
async fn read_handshake(stream: &mut TcpStream, key: &str) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).into_owned();
            verify_response(&head, key)?;
            return Ok(buf[end + 4..].to_vec());
        }
        if buf.len() > MAX_HANDSHAKE_BYTES {
            return Err(WireError::Handshake("response head too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(WireError::Handshake(
                "connection closed during handshake".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn send_masked(stream: &mut TcpStream, opcode: Opcode, payload: &[u8]) -> std::io::Result<()> {
    stream
        .write_all(&encode_frame(opcode, payload, Some(generate_mask())))
        .await
}

async fn listen(
    mut stream: TcpStream,
    leftover: Vec<u8>,
    handlers: Handlers,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::client();
    let mut pending = leftover;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let messages = match decoder.feed(&pending) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "bad frame from hub; closing push channel");
                let _ = send_masked(&mut stream, Opcode::Close, &1002u16.to_be_bytes()).await;
                return;
            }
        };
        pending.clear();

        for message in messages {
            match message {
                Message::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(value) => handlers.dispatch(&Inbound::Push(value)).await,
                    Err(err) => warn!(error = %err, "non-JSON push frame ignored"),
                },
                Message::Ping(payload) => {
                    if let Err(err) = send_masked(&mut stream, Opcode::Pong, &payload).await {
                        warn!(error = %err, "pong failed");
                        return;
                    }
                }
                Message::Close { code, .. } => {
                    debug!(?code, "hub closed push channel");
                    let echo = code.unwrap_or(NORMAL_CLOSURE).to_be_bytes();
                    let _ = send_masked(&mut stream, Opcode::Close, &echo).await;
                    return;
                }
                Message::Binary(_) | Message::Pong(_) => {}
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = send_masked(&mut stream, Opcode::Close, &NORMAL_CLOSURE.to_be_bytes()).await;
                let _ = stream.shutdown().await;
                debug!("push channel closed locally");
                return;
            }
            read = stream.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!("hub dropped push channel");
                    return;
                }
                Ok(n) => pending.extend_from_slice(&chunk[..n]),
                Err(err) => {
                    warn!(error = %err, "push channel read failed");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetbus_core::wire::handshake::accept_key;
    use fleetbus_core::wire::{encode_text, ping_frame};
    use tokio::net::TcpListener;

    /// Minimal hub side: accept the upgrade, read the register frame, push one
    /// message and a ping, then expect a masked pong back.
    async fn fake_hub(listener: TcpListener) -> (Vec<Message>, Vec<Message>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break end;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let key = head
            .lines()
            .find_map(|l| l.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .to_string();
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        );
        socket.write_all(response.as_bytes()).await.unwrap();

        let mut decoder = FrameDecoder::server();
        let mut first = decoder.feed(&buf[head_end + 4..]).unwrap();
        while first.is_empty() {
            let n = socket.read(&mut chunk).await.unwrap();
            first = decoder.feed(&chunk[..n]).unwrap();
        }

        socket
            .write_all(&encode_text(r#"{"type":"welcome","pmPort":1,"connectedAgents":1}"#))
            .await
            .unwrap();
        socket.write_all(&ping_frame(b"hb")).await.unwrap();

        let mut second = Vec::new();
        while second.is_empty() {
            let n = socket.read(&mut chunk).await.unwrap();
            second = decoder.feed(&chunk[..n]).unwrap();
        }
        (first, second)
    }

    #[tokio::test]
    async fn registers_receives_and_answers_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hub = tokio::spawn(fake_hub(listener));

        let handlers = Handlers::default();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        handlers
            .add(std::sync::Arc::new(move |inbound: &Inbound| {
                let _ = tx.send(inbound.clone());
            }))
            .await;

        let url = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let register = ClientFrame::Register {
            session_id: Some("S-1".into()),
            role: "worker".into(),
            capabilities: vec![],
        };
        let channel = PushChannel::open(&url, &register, handlers, Duration::from_secs(2))
            .await
            .unwrap();

        let pushed = rx.recv().await.unwrap();
        assert_eq!(pushed.kind(), Some("welcome"));

        let (first, second) = hub.await.unwrap();
        let registered: serde_json::Value =
            serde_json::from_str(first[0].as_text().unwrap()).unwrap();
        assert_eq!(registered["type"], "register");
        assert_eq!(registered["sessionId"], "S-1");
        assert_eq!(second, vec![Message::Pong(b"hb".to_vec())]);

        channel.close().await;
    }
}
