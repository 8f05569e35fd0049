//! `/api/connect`: the hand-rolled WebSocket endpoint.
//!
//! The upgrade handshake is answered here and the raw connection is taken
//! over from hyper; framing is done by `fleetbus_core::wire`. A connection
//! starts anonymous and becomes an agent's push link once it sends a valid
//! `register` frame.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use fleetbus_core::hub::{HeartbeatUpdate, LinkId};
use fleetbus_core::hub::registry::LINK_BUFFER;
use fleetbus_core::session::check_session;
use fleetbus_core::wire::{FrameDecoder, Message, accept_key, close_frame, encode_text, pong_frame};
use fleetbus_types::error::{SessionError, WireError};
use fleetbus_types::event::{HubEvent, Via};
use fleetbus_types::hub::{ClientFrame, ServerFrame};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::error::AppError;
use crate::hub::HubState;

const READ_CHUNK: usize = 8 * 1024;
const NORMAL_CLOSURE: u16 = 1000;
const GOING_AWAY: u16 = 1001;
const PROTOCOL_ERROR: u16 = 1002;
const MESSAGE_TOO_BIG: u16 = 1009;

/// Close code for a framing error.
fn close_code_for(err: &WireError) -> u16 {
    match err {
        WireError::FrameTooLarge { .. } | WireError::MessageTooLarge { .. } => MESSAGE_TOO_BIG,
        _ => PROTOCOL_ERROR,
    }
}

fn header_has_token(headers: &HeaderMap, name: axum::http::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// GET /api/connect
pub async fn connect(State(hub): State<HubState>, mut request: Request) -> Response {
    let headers = request.headers();
    let is_upgrade = header_has_token(headers, UPGRADE, "websocket")
        && header_has_token(headers, CONNECTION, "upgrade");
    let Some(key) = headers.get(SEC_WEBSOCKET_KEY).and_then(|k| k.to_str().ok()) else {
        return AppError::BadRequest("websocket upgrade required".to_string()).into_response();
    };
    if !is_upgrade {
        return AppError::BadRequest("websocket upgrade required".to_string()).into_response();
    }
    let Ok(accept) = HeaderValue::from_str(&accept_key(key)) else {
        return AppError::BadRequest("invalid Sec-WebSocket-Key".to_string()).into_response();
    };

    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => serve_socket(hub, TokioIo::new(upgraded)).await,
            Err(err) => warn!(error = %err, "websocket upgrade failed"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// The agent bound to a connection after `register`.
struct Binding {
    session_id: String,
    link: LinkId,
    outbox: mpsc::Receiver<String>,
}

async fn next_outbound(binding: &mut Option<Binding>) -> Option<String> {
    match binding {
        Some(binding) => binding.outbox.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_frame<S: AsyncWrite>(writer: &mut WriteHalf<S>, frame: &ServerFrame) -> std::io::Result<()> {
    let text = serde_json::to_string(frame).map_err(std::io::Error::other)?;
    writer.write_all(&encode_text(&text)).await
}

/// Drive one upgraded connection until either side closes it.
pub async fn serve_socket<S>(hub: HubState, io: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut decoder = FrameDecoder::server();
    let mut binding: Option<Binding> = None;
    let mut chunk = vec![0u8; READ_CHUNK];

    'conn: loop {
        tokio::select! {
            outbound = next_outbound(&mut binding) => match outbound {
                Some(text) => {
                    if let Err(err) = writer.write_all(&encode_text(&text)).await {
                        warn!(error = %err, "push write failed");
                        break 'conn;
                    }
                }
                None => {
                    // The hub dropped the link (shutdown or replaced).
                    let _ = writer.write_all(&close_frame(GOING_AWAY)).await;
                    break 'conn;
                }
            },
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => break 'conn,
                    Ok(n) => n,
                    Err(err) => {
                        debug!(error = %err, "websocket read failed");
                        break 'conn;
                    }
                };
                let messages = match decoder.feed(&chunk[..n]) {
                    Ok(messages) => messages,
                    Err(err) => {
                        warn!(error = %err, "protocol error; closing websocket");
                        let _ = writer.write_all(&close_frame(close_code_for(&err))).await;
                        break 'conn;
                    }
                };
                for message in messages {
                    let keep_open = match message {
                        Message::Text(text) => {
                            handle_text(&hub, &text, &mut binding, &mut writer).await
                        }
                        Message::Ping(payload) => writer.write_all(&pong_frame(&payload)).await.is_ok(),
                        Message::Close { code, .. } => {
                            let _ = writer
                                .write_all(&close_frame(code.unwrap_or(NORMAL_CLOSURE)))
                                .await;
                            false
                        }
                        Message::Binary(_) | Message::Pong(_) => true,
                    };
                    if !keep_open {
                        break 'conn;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    if let Some(binding) = binding {
        if hub.registry.detach(&binding.session_id, binding.link) {
            info!(session_id = %binding.session_id, "agent disconnected");
            hub.record(HubEvent::AgentDisconnected {
                session_id: binding.session_id,
                via: Via::Ws,
            })
            .await;
        }
    }
}

/// Handle one JSON frame. Returns `false` when the socket should close.
async fn handle_text<S: AsyncWrite>(
    hub: &HubState,
    text: &str,
    binding: &mut Option<Binding>,
    writer: &mut WriteHalf<S>,
) -> bool {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(error = %err, "unparseable client frame");
            let reply = ServerFrame::Error {
                message: format!("invalid frame: {err}"),
            };
            return write_frame(writer, &reply).await.is_ok();
        }
    };

    let reply = match frame {
        ClientFrame::Register {
            session_id,
            role,
            capabilities,
        } => {
            let session_id = session_id.unwrap_or_default();
            if let Err(err) = check_session(hub.sessions.as_ref(), &session_id) {
                let message = match err {
                    SessionError::Missing => err.to_string(),
                    _ => "Invalid session".to_string(),
                };
                Some(ServerFrame::Error { message })
            } else {
                if let Some(previous) = binding.take() {
                    hub.registry.detach(&previous.session_id, previous.link);
                }
                let record = hub.registry.register(&session_id, &role, capabilities, Utc::now());
                let (tx, outbox) = mpsc::channel(LINK_BUFFER);

                // Welcome goes out before the flushed backlog, which waits in
                // the channel until the select loop drains it.
                let welcome = ServerFrame::Welcome {
                    pm_port: hub.port().unwrap_or(0),
                    connected_agents: hub.registry.len(),
                };
                if write_frame(writer, &welcome).await.is_err() {
                    return false;
                }
                let (link, flushed) = hub.registry.attach(&session_id, tx);
                info!(session_id = %session_id, flushed, "agent registered over websocket");
                *binding = Some(Binding {
                    session_id: session_id.clone(),
                    link,
                    outbox,
                });
                hub.record(HubEvent::AgentRegistered {
                    session_id,
                    role: record.role,
                    via: Via::Ws,
                })
                .await;
                None
            }
        }
        ClientFrame::Heartbeat { pressure, task_id } => match binding.as_ref() {
            Some(bound) => {
                let update = HeartbeatUpdate {
                    role: None,
                    pressure,
                    task_id,
                };
                if hub.registry.heartbeat(&bound.session_id, update, Utc::now()) {
                    hub.record(HubEvent::AgentAutoRegistered {
                        session_id: bound.session_id.clone(),
                        via: Via::Ws,
                    })
                    .await;
                }
                None
            }
            None => Some(not_registered()),
        },
        ClientFrame::AskPm {
            question,
            request_id,
            context,
        } => match binding.as_ref() {
            Some(bound) => {
                let (guidance, error) = match &hub.brain {
                    None => (None, Some("Brain not available".to_string())),
                    Some(brain) => match brain.ask(&bound.session_id, &question, &context).await {
                        Ok(answer) => (Some(answer.guidance), None),
                        Err(err) => (None, Some(err.to_string())),
                    },
                };
                Some(ServerFrame::Answer {
                    request_id,
                    guidance,
                    error,
                })
            }
            None => Some(not_registered()),
        },
        ClientFrame::TaskComplete { task_id, result } => match binding.as_ref() {
            Some(bound) => {
                hub.registry.complete_task(&bound.session_id);
                hub.record(HubEvent::TaskComplete {
                    session_id: bound.session_id.clone(),
                    task_id,
                    result,
                    via: Via::Ws,
                })
                .await;
                None
            }
            None => Some(not_registered()),
        },
    };

    match reply {
        Some(frame) => write_frame(writer, &frame).await.is_ok(),
        None => true,
    }
}

fn not_registered() -> ServerFrame {
    ServerFrame::Error {
        message: "register first".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use fleetbus_core::wire::{Opcode, encode_frame, encode_masked_text};
    use fleetbus_types::config::HubConfig;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    use crate::hub::state::test_support::{add_session, hub_state};

    struct Client {
        io: DuplexStream,
        decoder: FrameDecoder,
        queue: VecDeque<Message>,
    }

    impl Client {
        async fn send(&mut self, frame: Value) {
            let bytes = encode_masked_text(&frame.to_string(), [1, 2, 3, 4]);
            self.io.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            let mut chunk = [0u8; 4096];
            loop {
                if let Some(message) = self.queue.pop_front() {
                    return message;
                }
                let n = self.io.read(&mut chunk).await.unwrap();
                assert!(n > 0, "server closed the socket");
                self.queue.extend(self.decoder.feed(&chunk[..n]).unwrap());
            }
        }

        async fn recv_json(&mut self) -> Value {
            match self.recv().await {
                Message::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text, got {other:?}"),
            }
        }
    }

    fn client(state: HubState) -> (Client, tokio::task::JoinHandle<()>) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve_socket(state, remote));
        (
            Client {
                io: local,
                decoder: FrameDecoder::client(),
                queue: VecDeque::new(),
            },
            task,
        )
    }

    #[tokio::test]
    async fn register_welcomes_then_flushes_backlog() {
        let tmp = TempDir::new().unwrap();
        add_session(&tmp, "S-1");
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        state.registry.send_to_agent("S-1", &json!({"type": "notify", "n": 1}));
        state.registry.send_to_agent("S-1", &json!({"type": "notify", "n": 2}));

        let (mut client, _task) = client(state.clone());
        client
            .send(json!({"type": "register", "sessionId": "S-1", "role": "backend"}))
            .await;

        let welcome = client.recv_json().await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["connectedAgents"], 1);
        assert_eq!(client.recv_json().await["n"], 1);
        assert_eq!(client.recv_json().await["n"], 2);
        assert!(state.registry.is_connected("S-1"));

        assert!(state.registry.send_to_agent("S-1", &json!({"n": 3})));
        assert_eq!(client.recv_json().await["n"], 3);
    }

    #[tokio::test]
    async fn invalid_session_gets_error_frame() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let (mut client, _task) = client(state.clone());

        client
            .send(json!({"type": "register", "sessionId": "../../etc/passwd"}))
            .await;
        let reply = client.recv_json().await;
        assert_eq!(reply, json!({"type": "error", "message": "Invalid session"}));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn ask_pm_answers_with_request_id() {
        let tmp = TempDir::new().unwrap();
        add_session(&tmp, "S-1");
        let state = hub_state(&tmp, HubConfig::default(), true).await;
        let (mut client, _task) = client(state);
        client.send(json!({"type": "register", "sessionId": "S-1"})).await;
        client.recv_json().await;

        client
            .send(json!({"type": "ask_pm", "question": "rebase?", "requestId": "r-1"}))
            .await;
        let answer = client.recv_json().await;
        assert_eq!(answer["type"], "answer");
        assert_eq!(answer["requestId"], "r-1");
        assert_eq!(answer["guidance"], "S-1: proceed with 'rebase?'");
    }

    #[tokio::test]
    async fn ping_gets_pong_and_close_is_echoed() {
        let tmp = TempDir::new().unwrap();
        add_session(&tmp, "S-1");
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let (mut client, task) = client(state.clone());
        client.send(json!({"type": "register", "sessionId": "S-1"})).await;
        client.recv_json().await;
        let mut events = state.events.subscribe();

        let ping = encode_frame(Opcode::Ping, b"hi", Some([9, 9, 9, 9]));
        client.io.write_all(&ping).await.unwrap();
        assert_eq!(client.recv().await, Message::Pong(b"hi".to_vec()));

        let close = encode_frame(Opcode::Close, &1000u16.to_be_bytes(), Some([5, 6, 7, 8]));
        client.io.write_all(&close).await.unwrap();
        assert!(matches!(client.recv().await, Message::Close { code: Some(1000), .. }));

        task.await.unwrap();
        assert_eq!(events.recv().await.unwrap().name(), "agent_disconnected");
        // The record survives the disconnect.
        assert!(state.registry.contains("S-1"));
        assert!(!state.registry.is_connected("S-1"));
    }

    #[tokio::test]
    async fn closing_all_links_closes_sockets() {
        let tmp = TempDir::new().unwrap();
        add_session(&tmp, "S-1");
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let (mut client, task) = client(state.clone());
        client.send(json!({"type": "register", "sessionId": "S-1"})).await;
        client.recv_json().await;

        assert_eq!(state.registry.close_all(), 1);
        assert!(matches!(client.recv().await, Message::Close { code: Some(1001), .. }));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn ask_pm_before_register_is_refused() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), true).await;
        let (mut client, _task) = client(state);

        client
            .send(json!({"type": "ask_pm", "question": "who am I?", "requestId": "r-0"}))
            .await;
        let reply = client.recv_json().await;
        assert_eq!(reply, json!({"type": "error", "message": "register first"}));
    }

    #[tokio::test]
    async fn unmasked_client_frame_closes_with_protocol_error() {
        let tmp = TempDir::new().unwrap();
        add_session(&tmp, "S-1");
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let (mut client, task) = client(state.clone());

        let register = json!({"type": "register", "sessionId": "S-1"}).to_string();
        client.io.write_all(&encode_text(&register)).await.unwrap();

        assert!(matches!(client.recv().await, Message::Close { code: Some(1002), .. }));
        task.await.unwrap();
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn oversized_ping_closes_with_protocol_error() {
        let tmp = TempDir::new().unwrap();
        let state = hub_state(&tmp, HubConfig::default(), false).await;
        let (mut client, task) = client(state);

        let ping = encode_frame(Opcode::Ping, &[7u8; 126], Some([1, 1, 1, 1]));
        client.io.write_all(&ping).await.unwrap();

        assert!(matches!(client.recv().await, Message::Close { code: Some(1002), .. }));
        task.await.unwrap();
    }
}
