//! Outbound writer loop: the only task that writes to an agent's transport.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::pending::{MessageEncoder, PendingMessage};
use crate::transport::Transport;

/// Why the writer loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The stop token fired.
    Stopped,
    /// A transport write failed; the connection is unusable.
    TransportFailed,
    /// Every sender of both queues was dropped.
    QueuesClosed,
}

/// Receiving halves of an agent's outbound queues.
#[derive(Debug)]
pub struct OutboundQueues {
    /// Pre-encoded packets (handshake, heartbeat probes).
    pub raw: mpsc::Receiver<Bytes>,
    /// Pushes and responses awaiting encoding.
    pub messages: mpsc::Receiver<PendingMessage>,
}

/// Drain both queues into `transport` until stopped or the transport breaks.
///
/// Logical messages are encoded and written in the order they were queued.
/// Messages that fail to encode are logged and dropped. Both queues are closed
/// on return so late senders fail fast.
pub async fn run_writer(
    transport: Arc<dyn Transport>,
    encoder: MessageEncoder,
    mut queues: OutboundQueues,
    stop: CancellationToken,
    session_id: u64,
) -> WriterExit {
    let (mut raw_open, mut messages_open) = (true, true);
    let exit = loop {
        if !raw_open && !messages_open {
            break WriterExit::QueuesClosed;
        }
        let data = tokio::select! {
            biased;
            () = stop.cancelled() => break WriterExit::Stopped,
            raw = queues.raw.recv(), if raw_open => match raw {
                Some(raw) => raw,
                None => {
                    raw_open = false;
                    continue;
                }
            },
            pending = queues.messages.recv(), if messages_open => match pending {
                Some(pending) => match encoder.encode(&pending) {
                    Ok(data) => data,
                    Err(err) => {
                        counter!("agent_messages_dropped_total").increment(1);
                        error!(
                            session_id,
                            route = %pending.route,
                            mid = pending.mid,
                            error = %err,
                            "failed to encode message, dropping"
                        );
                        continue;
                    }
                },
                None => {
                    messages_open = false;
                    continue;
                }
            },
        };

        let written = tokio::select! {
            biased;
            () = stop.cancelled() => break WriterExit::Stopped,
            written = transport.write(&data) => written,
        };
        if let Err(err) = written {
            error!(session_id, remote = %transport.remote_addr(), error = %err, "failed to write to transport");
            break WriterExit::TransportFailed;
        }
    };

    queues.raw.close();
    queues.messages.close();
    debug!(session_id, ?exit, "writer loop finished");
    exit
}
