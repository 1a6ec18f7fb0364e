//! Server Handle - process-wide configuration plus the live registry of
//! client sessions.
//!
//! The registry is a `DashMap`; its internal sharded locking stands in for
//! a single server mutex.

use crate::config::Config;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

/// Registry entry for one live client session - enough to log who is
/// connected without reaching back into the session's own state.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub address: String,
    pub hostname: String,
}

struct ServerState {
    config: Config,
    sessions: DashMap<Uuid, SessionInfo>,
    client_count: AtomicUsize,
    force_exit: AtomicBool,
    shutdown: Notify,
}

/// Cheaply cloneable handle shared by every session and by the accept loop.
#[derive(Clone)]
pub struct ServerHandle(Arc<ServerState>);

impl ServerHandle {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(ServerState {
            config,
            sessions: DashMap::new(),
            client_count: AtomicUsize::new(0),
            force_exit: AtomicBool::new(false),
            shutdown: Notify::new(),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Registers a session. The registry holds a session from connection
    /// establishment until close.
    pub fn add(&self, id: Uuid, info: SessionInfo) {
        self.0.sessions.insert(id, info);
        self.0.client_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a session. Safe to call more than once - the second call
    /// is a no-op.
    pub fn remove(&self, id: &Uuid) {
        if self.0.sessions.remove(id).is_some() {
            self.0.client_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.0.client_count.load(Ordering::SeqCst)
    }

    pub fn force_exit(&self) -> bool {
        self.0.force_exit.load(Ordering::SeqCst)
    }

    /// Sets `force_exit` and wakes anything waiting in [`ServerHandle::wait_shutdown`].
    pub fn shutdown(&self) {
        self.0.force_exit.store(true, Ordering::SeqCst);
        self.0.shutdown.notify_waiters();
    }

    pub async fn wait_shutdown(&self) {
        if self.force_exit() {
            return;
        }
        self.0.shutdown.notified().await;
    }

    /// Removes a session and, if `--once` is set and the registry has
    /// drained to empty, triggers shutdown.
    pub fn remove_and_maybe_exit(&self, id: &Uuid) {
        self.remove(id);
        if self.0.config.once && self.count() == 0 {
            info!("exiting due to the --once option");
            self.shutdown();
        }
    }
}
