//! Application die signal and connection drain.
//!
//! Every agent is built with the coordinator's die token, and every
//! connection task is spawned through it. Shutting down fires the token,
//! which closes all agents, and [`ShutdownCoordinator::drain`] then waits for
//! their connection tasks to wind down.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// How long [`ShutdownCoordinator::drain`] waits for connections by default.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the die signal shared by all agents and tracks connection tasks.
///
/// Clones share both the signal and the tracked set.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    die: CancellationToken,
    connections: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token to hand each new agent as its application die signal.
    pub fn die_token(&self) -> CancellationToken {
        self.die.clone()
    }

    /// Fire the die signal. Idempotent.
    pub fn shutdown(&self) {
        self.die.cancel();
    }

    /// Whether the die signal has fired.
    pub fn is_shutting_down(&self) -> bool {
        self.die.is_cancelled()
    }

    /// Spawn a connection task and track it until it finishes.
    ///
    /// Finished connections drop out of the tracked set on their own.
    pub fn spawn_connection<F>(&self, connection: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.connections.spawn(connection)
    }

    /// Connection tasks that have not finished yet.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Fire the die signal, stop accepting new tracked connections and wait
    /// up to `timeout` for the open ones to finish.
    ///
    /// Returns `false` when connections were still open at the deadline.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        let _ = self.connections.close();
        info!(
            open = self.open_connections(),
            timeout_ms = timeout.as_millis(),
            "draining connections"
        );

        if tokio::time::timeout(timeout, self.connections.wait()).await.is_ok() {
            true
        } else {
            warn!(
                open = self.open_connections(),
                "connections still open after {timeout:?}"
            );
            false
        }
    }
}
