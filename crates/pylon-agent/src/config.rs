//! Agent configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default pending-message backlog per agent.
pub const DEFAULT_WRITE_BACKLOG: usize = 16;

/// Per-agent tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Heartbeat interval in milliseconds. Clients silent for twice this long are dropped.
    pub heartbeat_interval_ms: u64,
    /// Capacity of each outbound queue.
    pub write_backlog: usize,
}

impl AgentConfig {
    /// Config with the given heartbeat interval and default backlog.
    pub fn with_heartbeat(interval: Duration) -> Self {
        Self {
            heartbeat_interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Silence threshold after which a client is considered dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval() * 2
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            write_backlog: DEFAULT_WRITE_BACKLOG,
        }
    }
}
