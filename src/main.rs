//! `pty-bridge` - a minimal ttyd-style PTY/WebSocket bridge.
//!
//! This binary is only the CLI front-end: argument parsing, logging
//! setup, and wiring a [`pty_bridge::Config`] into the server.

use clap::Parser;
use nix::sys::signal::Signal;
use pty_bridge::{server::ServerHandle, ws, Config};
use std::net::SocketAddr;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// A ttyd-style PTY/WebSocket bridge: spawns `command` in a pseudo-terminal
/// per connecting WebSocket client and streams its I/O over the wire.
#[derive(Parser, Debug)]
#[command(name = "pty-bridge", version, about, long_about = None)]
struct Cli {
    /// Address to bind the WebSocket server to.
    #[arg(short, long, default_value = "0.0.0.0:7681")]
    bind: SocketAddr,

    /// WebSocket path clients must upgrade on.
    #[arg(long, default_value = "/ws")]
    ws_path: String,

    /// Shared bearer token required in the client's JSON_DATA handshake.
    /// Unset disables authentication entirely.
    #[arg(short = 'c', long, env = "PTY_BRIDGE_CREDENTIAL")]
    credential: Option<String>,

    /// Reject INPUT frames; the PTY is still visible but not writable.
    #[arg(short = 'R', long)]
    readonly: bool,

    /// Enforce that the Origin header matches Host at handshake time.
    #[arg(short = 'O', long)]
    check_origin: bool,

    /// Serve exactly one client for the process lifetime, then exit.
    #[arg(short, long)]
    once: bool,

    /// Maximum concurrent clients. 0 means unlimited.
    #[arg(short = 'm', long, default_value_t = 0)]
    max_clients: usize,

    /// Reconnect delay in seconds advertised to clients.
    #[arg(short = 'r', long, default_value_t = 10)]
    reconnect: u32,

    /// Signal sent to a session's child process on teardown (by name, e.g. TERM, HUP, KILL).
    #[arg(short = 's', long, default_value = "HUP")]
    signal: String,

    /// Opaque JSON blob forwarded to clients verbatim as SET_PREFERENCES.
    #[arg(short = 't', long, default_value = "{}")]
    preferences: String,

    /// Command and arguments to run in the PTY for each connecting client.
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let sig = parse_signal(&self.signal)?;
        let command = self.command[0].clone();
        Ok(Config {
            bind: self.bind,
            command,
            argv: self.command,
            ws_path: self.ws_path,
            credential: self.credential,
            prefs_json: self.preferences,
            reconnect: self.reconnect,
            sig,
            readonly: self.readonly,
            once: self.once,
            check_origin: self.check_origin,
            max_clients: self.max_clients,
        })
    }
}

/// Accepts a bare signal name (`HUP`, `TERM`, ...) or the `SIG`-prefixed
/// form, matching the CLI convention `kill -l`/`kill -s` both accept.
fn parse_signal(name: &str) -> anyhow::Result<Signal> {
    let candidate = if name.to_ascii_uppercase().starts_with("SIG") {
        name.to_ascii_uppercase()
    } else {
        format!("SIG{}", name.to_ascii_uppercase())
    };
    Signal::from_str(&candidate).map_err(|_| anyhow::anyhow!("unknown signal: {name}"))
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pty_bridge=info")),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.into_config()?;

    tracing::info!(
        bind = %config.bind,
        command = %config.command,
        readonly = config.readonly,
        once = config.once,
        signal = config.sig_name(),
        "pty-bridge starting"
    );

    let server = ServerHandle::new(config);
    ws::serve(server).await
}
