//! Caller-facing errors of a network entity.

use thiserror::Error;

/// Errors returned to callers of the agent's public operations.
///
/// Internal pipeline failures (serialization, envelope or packet encoding)
/// never appear here; they are logged and the affected message is dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The agent is closed, or its writer already went away.
    #[error("broken low-level pipe")]
    BrokenPipe,
    /// The outbound queue is full.
    #[error("session send buffer exceeded")]
    BufferExceeded,
    /// Responses need a positive correlation id.
    #[error("invalid correlation id: responses require a request id")]
    InvalidCorrelationId,
    /// `close` on an agent that is already closed.
    #[error("close closed session")]
    AlreadyClosed,
    /// Capability intentionally left out.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl AgentError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::BrokenPipe => "broken_pipe",
            Self::BufferExceeded => "buffer_exceeded",
            Self::InvalidCorrelationId => "invalid_correlation_id",
            Self::AlreadyClosed => "already_closed",
            Self::NotImplemented(_) => "not_implemented",
        }
    }
}
