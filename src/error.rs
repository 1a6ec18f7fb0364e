//! Error types for the PTY/WebSocket bridge.
//!
//! Each concern gets its own `thiserror` enum so callers can match on
//! variant instead of string-sniffing; `anyhow` is reserved for the binary
//! boundary in `main.rs`, matching the teacher's `anyhow`-at-the-edges style.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenFailed(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnFailed(#[source] anyhow::Error),

    #[error("pty io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame payload")]
    Empty,

    #[error("unknown message tag: {0:#04x}")]
    UnknownTag(u8),
}

/// Fatal session errors - all of these close the WebSocket connection with
/// `UNEXPECTED_CONDITION` (1011) and destroy the session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("short write to websocket")]
    WsShortWrite,

    #[error("short write to pty")]
    PtyShortWrite,

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Rejections raised by the admission filter at handshake time. None of
/// these create a `ClientSession`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("refusing connection: server already serving a client (--once)")]
    OnceExhausted,

    #[error("refusing connection: server at max-clients capacity")]
    AtCapacity,

    #[error("refusing connection: unexpected websocket path {0:?}")]
    WrongPath(String),

    #[error("refusing connection: origin check failed")]
    OriginMismatch,
}
