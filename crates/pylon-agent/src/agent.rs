//! The per-connection agent.
//!
//! An [`Agent`] owns one client's transport and turns it into a bounded,
//! heartbeat-supervised outbound channel. [`Agent::handle`] runs two tasks:
//!
//! - the **writer** (the only task that writes to the transport), fed by a
//!   queue of pending pushes/responses and a queue of pre-encoded packets;
//! - the **heartbeat**, which queues a probe every interval and declares the
//!   client dead after two silent intervals.
//!
//! Any terminal condition (write failure, heartbeat timeout, application
//! shutdown, explicit [`Agent::close`]) ends in the same idempotent teardown.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use pylon_core::errors::AgentError;
use pylon_core::ids::AgentId;
use pylon_core::message::RouteDictionary;
use pylon_core::packet::PacketCodec;
use pylon_core::serialize::{Payload, Serializer};
use pylon_core::session::{NetworkEntity, Session};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::handshake::{HandshakeBlobs, process_blobs};
use crate::heartbeat::{ActivityClock, HeartbeatResult, run_heartbeat};
use crate::pending::{MessageEncoder, PendingMessage};
use crate::status::{AgentStatus, AtomicStatus};
use crate::transport::Transport;
use crate::writer::{OutboundQueues, WriterExit, run_writer};

/// One live client connection.
pub struct Agent {
    id: AgentId,
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    encoder: MessageEncoder,
    blobs: &'static HandshakeBlobs,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    status: AtomicStatus,
    clock: Arc<ActivityClock>,
    messages_tx: mpsc::Sender<PendingMessage>,
    raw_tx: mpsc::Sender<Bytes>,
    queues: Mutex<Option<OutboundQueues>>,
    done: CancellationToken,
    stop_writer: CancellationToken,
    stop_heartbeat: CancellationToken,
    app_die: CancellationToken,
    torn_down: AtomicBool,
}

impl Agent {
    /// Create an agent for a freshly accepted connection.
    ///
    /// The first agent created in the process also fixes the shared handshake
    /// and heartbeat packets (see [`crate::handshake`]). `app_die` is the
    /// application-wide shutdown signal; the agent observes it but never fires it.
    ///
    /// # Panics
    ///
    /// Panics if the shared handshake packets cannot be built.
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: Arc<dyn PacketCodec>,
        serializer: Arc<dyn Serializer>,
        routes: Arc<RouteDictionary>,
        config: &AgentConfig,
        app_die: CancellationToken,
    ) -> Arc<Self> {
        let blobs = process_blobs(
            config.heartbeat_interval(),
            codec.as_ref(),
            serializer.as_ref(),
            &routes,
        );
        let backlog = config.write_backlog.max(1);
        let (raw_tx, raw) = mpsc::channel(backlog);
        let (messages_tx, messages) = mpsc::channel(backlog);

        let agent = Arc::new_cyclic(|weak: &Weak<Self>| {
            let entity: Weak<dyn NetworkEntity> = weak.clone();
            Self {
                id: AgentId::new(),
                session: Arc::new(Session::new(entity)),
                transport,
                encoder: MessageEncoder::new(serializer, codec, routes),
                blobs,
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout: config.heartbeat_timeout(),
                status: AtomicStatus::new(AgentStatus::Start),
                clock: Arc::new(ActivityClock::new()),
                messages_tx,
                raw_tx,
                queues: Mutex::new(Some(OutboundQueues { raw, messages })),
                done: CancellationToken::new(),
                stop_writer: CancellationToken::new(),
                stop_heartbeat: CancellationToken::new(),
                app_die,
                torn_down: AtomicBool::new(false),
            }
        });

        gauge!("agent_connections_active").increment(1.0);
        debug!(
            agent_id = %agent.id,
            session_id = agent.session.id(),
            remote = %agent.remote_addr(),
            "agent created"
        );
        agent
    }

    /// Agent id.
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// The session owned by this agent.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Remote address of the client.
    pub fn remote_addr(&self) -> SocketAddr {
        self.transport.remote_addr()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> AgentStatus {
        self.status.load()
    }

    /// Overwrite the lifecycle status. Use [`Agent::close`] to close.
    pub fn set_status(&self, status: AgentStatus) {
        self.status.store(status);
    }

    /// Move to `status` unless the agent is already closed.
    ///
    /// Fails with [`AgentError::BrokenPipe`] once closed, so a racing
    /// [`Agent::close`] is never undone.
    pub fn advance_status(&self, status: AgentStatus) -> Result<(), AgentError> {
        if self.status.advance(status) {
            Ok(())
        } else {
            Err(AgentError::BrokenPipe)
        }
    }

    /// Record client activity; called by the read path for every packet.
    pub fn refresh_activity(&self) {
        self.clock.touch();
    }

    /// Time since the client was last heard from.
    pub fn idle_for(&self) -> Duration {
        self.clock.idle_for()
    }

    /// Heartbeat interval this agent supervises with.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// The process-wide framed handshake response.
    pub fn handshake_packet(&self) -> Bytes {
        self.blobs.handshake().clone()
    }

    /// Whether the agent is shutting down or closed.
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Resolves once the agent is shutting down for any reason.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Queue a push on `route`.
    pub fn push(&self, route: &str, payload: impl Into<Payload>) -> Result<(), AgentError> {
        if self.status() == AgentStatus::Closed {
            return Err(AgentError::BrokenPipe);
        }
        let payload = payload.into();
        debug!(
            session_id = self.session.id(),
            uid = %self.session.uid(),
            route,
            data = %payload.describe(),
            "type=push"
        );
        self.enqueue(PendingMessage::push(route, payload))
    }

    /// Queue the response to request `mid`.
    pub fn response_mid(&self, mid: u64, payload: impl Into<Payload>) -> Result<(), AgentError> {
        if mid == 0 {
            return Err(AgentError::InvalidCorrelationId);
        }
        if self.status() == AgentStatus::Closed {
            return Err(AgentError::BrokenPipe);
        }
        let payload = payload.into();
        debug!(
            session_id = self.session.id(),
            uid = %self.session.uid(),
            mid,
            data = %payload.describe(),
            "type=response"
        );
        self.enqueue(PendingMessage::response(mid, payload))
    }

    /// Queue an already-framed packet (the handshake response, for one).
    pub fn send_raw(&self, data: Bytes) -> Result<(), AgentError> {
        if self.status() == AgentStatus::Closed {
            return Err(AgentError::BrokenPipe);
        }
        self.raw_tx
            .try_send(data)
            .map_err(|err| self.rejected("raw", &err))
    }

    /// Forward a request to another server. Not supported.
    pub fn send_request(
        &self,
        server_id: &str,
        route: &str,
        _payload: impl Into<Payload>,
    ) -> Result<Bytes, AgentError> {
        debug!(session_id = self.session.id(), server_id, route, "send_request unsupported");
        Err(AgentError::NotImplemented("send_request"))
    }

    fn enqueue(&self, pending: PendingMessage) -> Result<(), AgentError> {
        match self.messages_tx.try_send(pending) {
            Ok(()) => {
                counter!("agent_messages_enqueued_total").increment(1);
                Ok(())
            }
            Err(err) => Err(self.rejected("messages", &err)),
        }
    }

    fn rejected<T>(&self, queue: &'static str, err: &TrySendError<T>) -> AgentError {
        let err = match err {
            TrySendError::Full(_) => {
                counter!("agent_backpressure_rejections_total", "queue" => queue).increment(1);
                AgentError::BufferExceeded
            }
            TrySendError::Closed(_) => AgentError::BrokenPipe,
        };
        debug!(
            session_id = self.session.id(),
            queue,
            error_kind = err.error_kind(),
            "outbound send rejected"
        );
        err
    }

    /// Run the agent: start the writer and heartbeat tasks and wait until the
    /// agent is done or the application shuts down, then close.
    ///
    /// Both tasks have finished when this returns. Only the first call does
    /// anything.
    pub async fn handle(self: Arc<Self>) {
        let session_id = self.session.id();
        let Some(queues) = self.queues.lock().take() else {
            warn!(session_id, "agent is already being handled");
            return;
        };

        let writer = tokio::spawn({
            let transport = Arc::clone(&self.transport);
            let encoder = self.encoder.clone();
            let stop = self.stop_writer.clone();
            let done = self.done.clone();
            async move {
                let exit = run_writer(transport, encoder, queues, stop, session_id).await;
                if exit != WriterExit::Stopped {
                    done.cancel();
                }
                exit
            }
        });

        let heartbeat = tokio::spawn({
            let clock = Arc::clone(&self.clock);
            let probe = self.blobs.heartbeat().clone();
            let raw_tx = self.raw_tx.clone();
            let (interval, timeout) = (self.heartbeat_interval, self.heartbeat_timeout);
            let stop = self.stop_heartbeat.clone();
            let done = self.done.clone();
            let remote = self.remote_addr();
            async move {
                let result = run_heartbeat(&clock, probe, raw_tx, interval, timeout, stop).await;
                match result {
                    HeartbeatResult::TimedOut => {
                        counter!("agent_heartbeat_timeouts_total").increment(1);
                        info!(
                            session_id,
                            %remote,
                            idle_ms = clock.idle_for().as_millis(),
                            timeout_ms = timeout.as_millis(),
                            "heartbeat timeout, closing agent"
                        );
                        done.cancel();
                    }
                    HeartbeatResult::ProbeFailed => {
                        debug!(session_id, %remote, "heartbeat probe not delivered, closing agent");
                        done.cancel();
                    }
                    HeartbeatResult::Cancelled => {}
                }
                result
            }
        });

        tokio::select! {
            () = self.done.cancelled() => {}
            () = self.app_die.cancelled() => {
                debug!(session_id, "application shutting down, closing agent");
            }
        }
        if let Err(err) = self.close().await {
            debug!(session_id, error = %err, "agent was already closed");
        }

        let (writer, heartbeat) = futures::future::join(writer, heartbeat).await;
        match writer {
            Ok(exit) => debug!(session_id, ?exit, "writer stopped"),
            Err(err) => error!(session_id, error = %err, "writer task failed"),
        }
        if let Err(err) = heartbeat {
            error!(session_id, error = %err, "heartbeat task failed");
        }
    }

    /// Close the agent.
    ///
    /// The first call stops both tasks, fires the done signal and runs the
    /// session's close callbacks. Later calls return
    /// [`AgentError::AlreadyClosed`]. Every call closes the transport.
    pub async fn close(&self) -> Result<(), AgentError> {
        let previous = self.status.swap(AgentStatus::Closed);
        if previous != AgentStatus::Closed {
            debug!(
                session_id = self.session.id(),
                uid = %self.session.uid(),
                remote = %self.remote_addr(),
                "closing agent"
            );
        }
        self.teardown();

        if let Err(err) = self.transport.close().await {
            warn!(session_id = self.session.id(), error = %err, "failed to close transport");
        }

        if previous == AgentStatus::Closed {
            Err(AgentError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_writer.cancel();
        self.stop_heartbeat.cancel();
        self.done.cancel();

        let panicked = self.session.run_close_callbacks();
        if panicked > 0 {
            warn!(session_id = self.session.id(), panicked, "close callbacks panicked");
        }
        gauge!("agent_connections_active").decrement(1.0);
        counter!("agent_close_total").increment(1);
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Remote={}, Idle={}ms",
            self.remote_addr(),
            self.idle_for().as_millis()
        )
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .field("status", &self.status())
            .field("remote", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NetworkEntity for Agent {
    async fn push(&self, route: &str, payload: Payload) -> Result<(), AgentError> {
        Agent::push(self, route, payload)
    }

    async fn response_mid(&self, mid: u64, payload: Payload) -> Result<(), AgentError> {
        Agent::response_mid(self, mid, payload)
    }

    async fn close(&self) -> Result<(), AgentError> {
        Agent::close(self).await
    }

    fn remote_addr(&self) -> SocketAddr {
        Agent::remote_addr(self)
    }
}
