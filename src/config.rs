//! Process-wide configuration, shared immutably by every client session.
//!
//! Populated by the CLI front-end in `main.rs`; argument parsing itself
//! lives there, not in this module.

use nix::sys::signal::Signal;
use std::net::SocketAddr;

/// Immutable, process-wide configuration shared by all sessions via `Arc<Config>`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the WebSocket server binds to.
    pub bind: SocketAddr,
    /// Display name shown in `SET_WINDOW_TITLE` (usually `argv[0]`'s basename).
    pub command: String,
    /// Full argv executed in the PTY for each session.
    pub argv: Vec<String>,
    /// The single WebSocket URI path this server accepts upgrades on.
    pub ws_path: String,
    /// Shared bearer token. `None` disables authentication entirely.
    pub credential: Option<String>,
    /// Opaque JSON blob forwarded to clients verbatim as `SET_PREFERENCES`.
    pub prefs_json: String,
    /// Reconnect delay (seconds) advertised to clients via `SET_RECONNECT`.
    pub reconnect: u32,
    /// Signal sent to a session's child process on teardown.
    pub sig: Signal,
    /// When set, `INPUT` frames are accepted but dropped before reaching the PTY.
    pub readonly: bool,
    /// Serve at most one client for the process lifetime; exit once it disconnects.
    pub once: bool,
    /// Enforce `Origin`/`Host` equivalence at handshake time.
    pub check_origin: bool,
    /// Maximum concurrent clients. `0` means unlimited.
    pub max_clients: usize,
}

impl Config {
    pub fn sig_name(&self) -> &'static str {
        self.sig.as_str()
    }
}
