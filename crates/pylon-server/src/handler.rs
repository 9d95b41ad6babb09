//! Application-side dispatch of client messages.

use std::sync::Arc;

use async_trait::async_trait;
use pylon_agent::{Agent, AgentError};
use pylon_core::message::{Message, MessageType};
use pylon_core::serialize::Payload;
use tracing::{debug, warn};

/// Receives every decoded client message of a working connection.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message from `agent`'s client.
    ///
    /// Errors are logged by the read path; the connection stays open.
    async fn handle(&self, agent: &Arc<Agent>, message: Message) -> Result<(), AgentError>;
}

/// Answers every request with its own payload and logs notifies.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, agent: &Arc<Agent>, message: Message) -> Result<(), AgentError> {
        match message.kind {
            MessageType::Request => agent.response_mid(message.id, Payload::Raw(message.data)),
            MessageType::Notify => {
                debug!(
                    session_id = agent.session().id(),
                    route = %message.route,
                    bytes = message.data.len(),
                    "notify received"
                );
                Ok(())
            }
            MessageType::Response | MessageType::Push => {
                warn!(
                    session_id = agent.session().id(),
                    kind = ?message.kind,
                    "client sent a server-only message type, ignoring"
                );
                Ok(())
            }
        }
    }
}
