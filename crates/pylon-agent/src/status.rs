//! Agent lifecycle status.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of an agent.
///
/// Only [`AgentStatus::Closed`] changes agent behavior; the others are
/// bookkeeping for the read path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AgentStatus {
    /// Connection accepted, nothing received yet.
    Start = 1,
    /// Handshake received, waiting for the client's ack.
    Handshake = 2,
    /// Handshake acknowledged; data packets are accepted.
    Working = 3,
    /// Closed; every send is rejected.
    Closed = 4,
}

impl AgentStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Start,
            2 => Self::Handshake,
            3 => Self::Working,
            _ => Self::Closed,
        }
    }

    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Handshake => "handshake",
            Self::Working => "working",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free status cell shared by every task of an agent.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    /// New cell holding `status`.
    pub fn new(status: AgentStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    /// Current status.
    pub fn load(&self) -> AgentStatus {
        AgentStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Overwrite the status. Transitions are not validated.
    pub fn store(&self, status: AgentStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Store `status` unless the cell already holds `Closed`.
    ///
    /// Returns `false` when the cell was closed and nothing was stored.
    pub fn advance(&self, status: AgentStatus) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != AgentStatus::Closed as u8).then_some(status as u8)
            })
            .is_ok()
    }

    /// Store `status` and return the previous one.
    pub fn swap(&self, status: AgentStatus) -> AgentStatus {
        AgentStatus::from_u8(self.0.swap(status as u8, Ordering::AcqRel))
    }
}
