//! `PylonServer`: TCP acceptor that gives every connection an agent.

use std::net::SocketAddr;
use std::sync::Arc;

use metrics::counter;
use pylon_agent::transport::StreamTransport;
use pylon_agent::{Agent, AgentConfig};
use pylon_core::message::RouteDictionary;
use pylon_core::packet::{PacketCodec, PomeloPacketCodec};
use pylon_core::serialize::{JsonSerializer, Serializer};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::read_loop;
use crate::errors::ServerError;
use crate::handler::MessageHandler;
use crate::settings::ServerSettings;
use crate::shutdown::ShutdownCoordinator;

/// Everything a connection needs, shared across connections.
#[derive(Clone)]
struct ConnectionDeps {
    config: AgentConfig,
    codec: Arc<dyn PacketCodec>,
    serializer: Arc<dyn Serializer>,
    routes: Arc<RouteDictionary>,
    handler: Arc<dyn MessageHandler>,
}

/// The Pylon frontend server.
pub struct PylonServer {
    listener: TcpListener,
    deps: ConnectionDeps,
    shutdown: ShutdownCoordinator,
}

impl std::fmt::Debug for PylonServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PylonServer")
            .field("listener", &self.listener)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

impl PylonServer {
    /// Bind the listener described by `settings`.
    ///
    /// Connections are answered by `handler`; firing `shutdown` stops the
    /// listener and closes every agent.
    pub async fn bind(
        settings: &ServerSettings,
        handler: Arc<dyn MessageHandler>,
        shutdown: ShutdownCoordinator,
    ) -> Result<Self, ServerError> {
        let routes = settings.route_dictionary()?;
        let addr = settings.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            deps: ConnectionDeps {
                config: settings.agent_config(),
                codec: Arc::new(PomeloPacketCodec),
                serializer: Arc::new(JsonSerializer),
                routes: Arc::new(routes),
                handler,
            },
            shutdown,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// The coordinator whose die signal closes this server's agents.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Accept connections until shutdown, then wait for connections to drain.
    pub async fn serve(self) -> Result<(), ServerError> {
        let die = self.shutdown.die_token();
        info!(
            addr = %self.local_addr()?,
            heartbeat_ms = self.deps.config.heartbeat_interval_ms,
            routes = self.deps.routes.len(),
            "pylon server listening"
        );

        loop {
            let accepted = tokio::select! {
                biased;
                () = die.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    counter!("server_connections_accepted_total").increment(1);
                    let _ = self.shutdown.spawn_connection(serve_connection(
                        stream,
                        remote,
                        self.deps.clone(),
                        self.shutdown.die_token(),
                    ));
                }
                Err(err) => warn!(error = %err, "failed to accept connection"),
            }
        }

        info!(open = self.shutdown.open_connections(), "pylon server shutting down");
        let _ = self.shutdown.drain(None).await;
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    deps: ConnectionDeps,
    app_die: CancellationToken,
) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%remote, error = %err, "failed to set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();

    let agent = Agent::new(
        Arc::new(StreamTransport::new(writer, remote)),
        Arc::clone(&deps.codec),
        deps.serializer,
        Arc::clone(&deps.routes),
        &deps.config,
        app_die,
    );
    debug!(%remote, session_id = agent.session().id(), "connection accepted");

    let runner = tokio::spawn(Arc::clone(&agent).handle());
    read_loop(agent, reader, deps.codec, deps.routes, deps.handler).await;
    if let Err(err) = runner.await {
        warn!(%remote, error = %err, "agent task failed");
    }
}
