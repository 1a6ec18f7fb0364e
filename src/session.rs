//! Client Session - the full-duplex coupling of one PTY with one
//! WebSocket connection.
//!
//! Driven as one `tokio::select!` loop per connection, merging the WS read
//! half with a bounded (capacity 1) channel fed by a dedicated blocking
//! reader task. The channel gives an at-most-one-chunk-in-flight guarantee
//! without a hand-rolled mutex/spin-wait.
//!
//! Fragment reassembly is handled by `tokio-tungstenite` itself:
//! `Message::Binary` is already a complete, defragmented logical message
//! by the time it reaches this module, so there is no manual buffer to
//! own here.

use crate::config::Config;
use crate::error::{PtyError, SessionError};
use crate::protocol::{self, ClientMessage, ServerMessage, WindowSize};
use crate::pty::PtySession;
use crate::server::{ServerHandle, SessionInfo};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::io::Read;
use std::net::SocketAddr;
use subtle::ConstantTimeEq;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One chunk handed from the blocking PTY reader task to the session's
/// `tokio::select!` loop.
enum PtyEvent {
    Data(Vec<u8>),
    Eof,
    Error,
}

struct SessionState {
    id: Uuid,
    authenticated: bool,
    pty: Option<PtySession>,
    pending_resize: Option<WindowSize>,
}

/// Drives one WebSocket connection end to end: registration, handshake,
/// auth, lazy PTY spawn, full-duplex bridging, and teardown.
pub async fn run(ws: WebSocketStream<TcpStream>, peer: SocketAddr, server: ServerHandle) {
    let id = Uuid::new_v4();
    let address = peer.ip().to_string();
    let peer_hostname = address.clone();

    server.add(
        id,
        SessionInfo {
            address: address.clone(),
            hostname: peer_hostname.clone(),
        },
    );
    let _guard = RegistryGuard {
        server: server.clone(),
        id,
    };

    info!(
        %id,
        address = %address,
        clients = server.count(),
        "websocket established"
    );

    if let Err(e) = drive(ws, &server, id).await {
        warn!(%id, error = %e, "session ended with error");
    }

    info!(%id, address = %address, "websocket closed");
}

/// Unregisters the session on drop so every exit path - early handshake
/// failure, protocol violation, normal close - removes it exactly once.
struct RegistryGuard {
    server: ServerHandle,
    id: Uuid,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.server.remove_and_maybe_exit(&self.id);
    }
}

async fn drive(
    ws: WebSocketStream<TcpStream>,
    server: &ServerHandle,
    id: Uuid,
) -> Result<(), SessionError> {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let cfg = server.config().clone();

    let server_hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());

    // The three initial frames, in fixed order.
    let initial = [
        ServerMessage::SetWindowTitle(format!("{} ({server_hostname})", cfg.command)),
        ServerMessage::SetReconnect(cfg.reconnect),
        ServerMessage::SetPreferences(cfg.prefs_json.clone()),
    ];
    for msg in &initial {
        if send(&mut ws_tx, msg).await.is_err() {
            warn!(%id, "short write sending initial handshake frame, closing");
            let _ = ws_tx
                .send(Message::Close(Some(close_with(CloseCode::Error))))
                .await;
            return Err(SessionError::WsShortWrite);
        }
    }

    let mut state = SessionState {
        id,
        authenticated: cfg.credential.is_none(),
        pty: None,
        pending_resize: None,
    };

    let (pty_tx, mut pty_rx) = mpsc::channel::<PtyEvent>(1);

    let close_frame = loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        match handle_frame(&bytes, &mut state, &cfg, &pty_tx).await {
                            Ok(Some(reply)) => {
                                if send(&mut ws_tx, &reply).await.is_err() {
                                    warn!(%id, "short write replying to client frame, closing");
                                    break Some(close_with(CloseCode::Error));
                                }
                            }
                            Ok(None) => {}
                            Err(code) => break Some(close_with(code)),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%id, error = %e, "websocket receive error");
                        break Some(close_with(CloseCode::Error));
                    }
                }
            }
            Some(event) = pty_rx.recv(), if state.pty.is_some() => {
                match event {
                    PtyEvent::Data(bytes) => {
                        let msg = ServerMessage::Output(bytes);
                        if send(&mut ws_tx, &msg).await.is_err() {
                            warn!(%id, "short write sending OUTPUT frame");
                        }
                    }
                    PtyEvent::Eof => break Some(close_with(CloseCode::Normal)),
                    PtyEvent::Error => break Some(close_with(CloseCode::Error)),
                }
            }
        }
    };

    if let Some(frame) = close_frame {
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
    }

    if let Some(pty) = state.pty.as_mut() {
        pty.terminate(cfg.sig);
    }

    Ok(())
}

fn close_with(code: CloseCode) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: "".into(),
    }
}

async fn send(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), ()> {
    ws_tx
        .send(Message::Binary(msg.encode()))
        .await
        .map_err(|_| ())
}

/// Dispatches one fully-reassembled inbound frame. Returns an optional
/// reply to write back, or a close code if the frame is fatal to the
/// connection.
async fn handle_frame(
    buf: &[u8],
    state: &mut SessionState,
    cfg: &Config,
    pty_tx: &mpsc::Sender<PtyEvent>,
) -> Result<Option<ServerMessage>, CloseCode> {
    let tag = *buf.first().unwrap_or(&0);

    // Auth gate runs on the raw tag byte, before decoding, matching the
    // original's `command != JSON_DATA` check ahead of its switch.
    if cfg.credential.is_some() && !state.authenticated && tag != protocol::TAG_JSON_DATA {
        warn!(id = %state.id, "frame rejected: not authenticated");
        return Err(CloseCode::Policy);
    }

    let msg = ClientMessage::decode(buf).map_err(|_| CloseCode::Invalid)?;

    match msg {
        ClientMessage::Input(data) => {
            if cfg.readonly {
                return Ok(None);
            }
            let Some(pty) = state.pty.as_mut() else {
                return Ok(None);
            };
            pty.write(&data).map_err(|_| CloseCode::Error)?;
            Ok(None)
        }
        ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        ClientMessage::ResizeTerminal(size) => {
            if let Some(size) = size {
                state.pending_resize = Some(size);
                if let Some(pty) = state.pty.as_ref() {
                    pty.resize(size);
                }
            }
            Ok(None)
        }
        ClientMessage::JsonData(value) => {
            // Once the child exists, a later JSON_DATA is a silent no-op.
            if state.pty.is_some() {
                return Ok(None);
            }

            if let Some(credential) = &cfg.credential {
                let token = value.get("AuthToken").and_then(Value::as_str).unwrap_or("");
                if !token_matches(token, credential) {
                    warn!(id = %state.id, "authentication failed");
                    return Err(CloseCode::Policy);
                }
                state.authenticated = true;
            }

            spawn_child(state, cfg, pty_tx.clone())
                .await
                .map_err(|_| CloseCode::Error)?;
            Ok(None)
        }
    }
}

/// Constant-time credential comparison.
fn token_matches(given: &str, expected: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Spawns the child process (at most once per session) and a dedicated
/// blocking thread that reads PTY output and feeds it into the session's
/// bounded channel.
async fn spawn_child(
    state: &mut SessionState,
    cfg: &Config,
    pty_tx: mpsc::Sender<PtyEvent>,
) -> Result<(), PtyError> {
    let argv = cfg.argv.clone();
    let (mut pty, mut reader) = tokio::task::spawn_blocking(move || PtySession::spawn(&argv))
        .await
        .map_err(|e| PtyError::SpawnFailed(anyhow::anyhow!(e)))??;

    if let Some(size) = state.pending_resize {
        pty.resize(size);
    }

    let id = state.id;
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = pty_tx.blocking_send(PtyEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if pty_tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%id, error = %e, "pty read error");
                    let _ = pty_tx.blocking_send(PtyEvent::Error);
                    break;
                }
            }
        }
    });

    state.pty = Some(pty);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(credential: Option<&str>) -> Config {
        Config {
            bind: "127.0.0.1:7681".parse().unwrap(),
            command: "cat".to_string(),
            argv: vec!["cat".to_string()],
            ws_path: "/ws".to_string(),
            credential: credential.map(str::to_string),
            prefs_json: "{}".to_string(),
            reconnect: 10,
            sig: nix::sys::signal::Signal::SIGHUP,
            readonly: false,
            once: false,
            check_origin: false,
            max_clients: 0,
        }
    }

    fn state(id: Uuid, authenticated: bool) -> SessionState {
        SessionState {
            id,
            authenticated,
            pty: None,
            pending_resize: None,
        }
    }

    #[tokio::test]
    async fn unauthenticated_non_json_frame_is_rejected() {
        let cfg = config(Some("s3cret"));
        let mut st = state(Uuid::new_v4(), false);
        let (tx, _rx) = mpsc::channel(1);
        let result = handle_frame(b"0hello", &mut st, &cfg, &tx).await;
        assert_eq!(result.unwrap_err(), CloseCode::Policy);
    }

    #[tokio::test]
    async fn ping_without_auth_required_gets_pong() {
        let cfg = config(None);
        let mut st = state(Uuid::new_v4(), true);
        let (tx, _rx) = mpsc::channel(1);
        let result = handle_frame(b"1", &mut st, &cfg, &tx).await;
        assert_eq!(result.unwrap(), Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn readonly_drops_input() {
        let mut cfg = config(None);
        cfg.readonly = true;
        let mut st = state(Uuid::new_v4(), true);
        let (tx, _rx) = mpsc::channel(1);
        let result = handle_frame(b"0ignored", &mut st, &cfg, &tx).await;
        assert_eq!(result.unwrap(), None);
    }

    #[tokio::test]
    async fn resize_without_pty_is_stored_not_applied() {
        let cfg = config(None);
        let mut st = state(Uuid::new_v4(), true);
        let (tx, _rx) = mpsc::channel(1);
        let result = handle_frame(br#"2{"columns":80,"rows":24}"#, &mut st, &cfg, &tx).await;
        assert_eq!(result.unwrap(), None);
        assert_eq!(
            st.pending_resize,
            Some(WindowSize {
                columns: 80,
                rows: 24
            })
        );
    }

    #[tokio::test]
    async fn unknown_tag_is_invalid_payload() {
        let cfg = config(None);
        let mut st = state(Uuid::new_v4(), true);
        let (tx, _rx) = mpsc::channel(1);
        let result = handle_frame(b"9nope", &mut st, &cfg, &tx).await;
        assert_eq!(result.unwrap_err(), CloseCode::Invalid);
    }

    #[test]
    fn token_comparison_rejects_wrong_length() {
        assert!(!token_matches("short", "muchlongertoken"));
        assert!(!token_matches("wrong", "right1"));
        assert!(token_matches("s3cret", "s3cret"));
    }
}
