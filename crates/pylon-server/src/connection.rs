//! Read path of one client connection.
//!
//! Packets are decoded off the read half and drive the agent:
//!
//! | packet          | effect                                                     |
//! |-----------------|------------------------------------------------------------|
//! | `Handshake`     | status `Handshake`, handshake response queued              |
//! | `HandshakeAck`  | status `Working`                                           |
//! | `Heartbeat`     | nothing beyond the activity refresh every packet gets      |
//! | `Data`          | envelope decoded and passed to the [`MessageHandler`]      |
//! | `Kick`          | protocol error                                             |
//!
//! Any protocol or read error, EOF, or the agent shutting down ends the loop
//! and closes the agent.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use pylon_agent::{Agent, AgentError, AgentStatus};
use pylon_core::message::{Message, MessageError, RouteDictionary};
use pylon_core::packet::{Packet, PacketCodec, PacketError, PacketKind};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, warn};

use crate::handler::MessageHandler;

/// Session key holding the client's handshake payload.
pub const HANDSHAKE_DATA_KEY: &str = "handshake";

/// Why a connection's read loop ended.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Reading from the socket failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
    /// Bytes on the wire are not a valid packet.
    #[error(transparent)]
    Packet(#[from] PacketError),
    /// A data packet carried an invalid message envelope.
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The handshake body is not JSON.
    #[error("invalid handshake body: {0}")]
    Handshake(#[source] serde_json::Error),
    /// Data arrived before the client acknowledged the handshake.
    #[error("received data before handshake ack")]
    NotAcknowledged,
    /// A packet kind clients must not send.
    #[error("unexpected {0:?} packet from client")]
    UnexpectedPacket(PacketKind),
    /// The agent was closed or refused the handshake response.
    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// [`Decoder`] over a [`PacketCodec`].
pub struct PacketDecoder {
    codec: Arc<dyn PacketCodec>,
}

impl PacketDecoder {
    /// Decode with `codec`.
    pub fn new(codec: Arc<dyn PacketCodec>) -> Self {
        Self { codec }
    }
}

impl Decoder for PacketDecoder {
    type Item = Packet;
    type Error = ConnectionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, ConnectionError> {
        Ok(self.codec.decode(src)?)
    }
}

/// Read packets from `reader` until the client goes away or the agent closes.
///
/// The agent is closed on return.
pub async fn read_loop<R>(
    agent: Arc<Agent>,
    reader: R,
    codec: Arc<dyn PacketCodec>,
    routes: Arc<RouteDictionary>,
    handler: Arc<dyn MessageHandler>,
) where
    R: AsyncRead + Unpin + Send,
{
    let session_id = agent.session().id();
    let mut frames = FramedRead::new(reader, PacketDecoder::new(codec));

    loop {
        let next = tokio::select! {
            biased;
            () = agent.closed() => break,
            next = frames.next() => next,
        };
        match next {
            None => {
                debug!(session_id, remote = %agent.remote_addr(), "client disconnected");
                break;
            }
            Some(Err(err)) => {
                warn!(session_id, remote = %agent.remote_addr(), error = %err, "failed to read packet");
                break;
            }
            Some(Ok(packet)) => {
                if let Err(err) = process_packet(&agent, packet, &routes, handler.as_ref()).await {
                    warn!(session_id, remote = %agent.remote_addr(), error = %err, "closing connection");
                    break;
                }
            }
        }
    }

    if let Err(err) = agent.close().await {
        debug!(session_id, error = %err, "agent was already closed");
    }
}

/// Apply one packet to `agent`.
pub async fn process_packet(
    agent: &Arc<Agent>,
    packet: Packet,
    routes: &RouteDictionary,
    handler: &dyn MessageHandler,
) -> Result<(), ConnectionError> {
    match packet.kind {
        PacketKind::Handshake => {
            if !packet.body.is_empty() {
                let data: Value =
                    serde_json::from_slice(&packet.body).map_err(ConnectionError::Handshake)?;
                agent.session().set(HANDSHAKE_DATA_KEY, data);
            }
            agent.advance_status(AgentStatus::Handshake)?;
            agent.send_raw(agent.handshake_packet())?;
            debug!(session_id = agent.session().id(), remote = %agent.remote_addr(), "handshake sent");
        }
        PacketKind::HandshakeAck => {
            agent.advance_status(AgentStatus::Working)?;
            debug!(session_id = agent.session().id(), "handshake acknowledged");
        }
        PacketKind::Heartbeat => {}
        PacketKind::Data => {
            if agent.status() != AgentStatus::Working {
                return Err(ConnectionError::NotAcknowledged);
            }
            let message = Message::decode(&packet.body, routes)?;
            let (kind, id) = (message.kind, message.id);
            if let Err(err) = handler.handle(agent, message).await {
                warn!(
                    session_id = agent.session().id(),
                    ?kind,
                    mid = id,
                    error_kind = err.error_kind(),
                    error = %err,
                    "message handler failed"
                );
            }
        }
        PacketKind::Kick => return Err(ConnectionError::UnexpectedPacket(packet.kind)),
    }

    agent.refresh_activity();
    Ok(())
}
