//! WebSocket Event Loop - the TCP accept loop and per-connection upgrade.
//! Runs the Admission Filter against the raw upgrade request before the
//! handshake completes, and races the accept loop against server shutdown.

use crate::admission::{self, AdmissionRequest};
use crate::error::AdmissionError;
use crate::server::ServerHandle;
use crate::session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};

/// Binds `server.config().bind` and accepts connections until the server
/// is told to shut down (`ServerHandle::shutdown`, e.g. via `--once` or a
/// signal handled in `main.rs`).
pub async fn serve(server: ServerHandle) -> anyhow::Result<()> {
    let addr = server.config().bind;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, path = %server.config().ws_path, "listening");

    // Tracks whether a client has ever connected, for the `--once`
    // admission check: a second connection attempt after the first client
    // disconnects must still be refused, not merely the presence of a
    // *current* client.
    let connected_once = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        continue;
                    }
                };
                tokio::spawn(accept_connection(
                    stream,
                    peer,
                    server.clone(),
                    connected_once.clone(),
                ));
            }
            _ = server.wait_shutdown() => {
                info!("shutting down accept loop");
                return Ok(());
            }
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer: std::net::SocketAddr,
    server: ServerHandle,
    connected_once: Arc<AtomicBool>,
) {
    let cfg = server.config();
    let client_count = server.count();
    let once_already_served = connected_once.load(Ordering::SeqCst);

    // The admission filter runs inside the handshake callback so a
    // rejection is reflected straight back as the HTTP upgrade response,
    // before any `ClientSession` is registered.
    let callback = move |req: &Request, response: Response| {
        let path = req.uri().path();
        let origin = req
            .headers()
            .get("origin")
            .and_then(|v| v.to_str().ok());
        let host = req.headers().get("host").and_then(|v| v.to_str().ok());

        let admission_req = AdmissionRequest { path, origin, host };
        admission::check(&admission_req, cfg, client_count, once_already_served)
            .map(|()| response)
            .map_err(rejection_response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake rejected");
            return;
        }
    };

    connected_once.store(true, Ordering::SeqCst);
    session::run(ws, peer, server).await;
}

/// Maps an admission rejection onto the HTTP status the upgrade request
/// is answered with, closest to what the equivalent libwebsockets
/// `LWS_CALLBACK_FILTER_*` rejection produces.
fn rejection_response(err: AdmissionError) -> ErrorResponse {
    let status = match err {
        AdmissionError::OnceExhausted | AdmissionError::AtCapacity => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AdmissionError::WrongPath(_) => StatusCode::NOT_FOUND,
        AdmissionError::OriginMismatch => StatusCode::FORBIDDEN,
    };

    let mut resp = ErrorResponse::new(Some(err.to_string()));
    *resp.status_mut() = status;
    resp
}
