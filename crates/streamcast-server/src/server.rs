//! Process bootstrap: bind, dial, and wire the tasks together.

use std::net::SocketAddr;

use streamcast_core::Message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::coordinator::{Coordinator, Event};

/// A running server. Dropping the handle does not stop it; call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    coordinator: JoinHandle<()>,
    listener: JoinHandle<()>,
    gossip: JoinHandle<()>,
}

impl ServerHandle {
    /// The address actually bound, which matters when the configured
    /// port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask the coordinator to tear everything down.
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown);
        self.listener.abort();
        self.gossip.abort();
    }

    /// Wait for the coordinator to finish.
    pub async fn join(self) {
        let _ = self.coordinator.await;
    }
}

/// Bind the listener, dial the configured remote peer, and start the
/// coordinator and gossip tasks.
pub async fn spawn(mut config: ServerConfig) -> anyhow::Result<ServerHandle> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    let local_addr = listener.local_addr()?;
    // Announce the effective port; the configured one may have been 0.
    config.port = local_addr.port();

    let (events, events_rx) = mpsc::unbounded_channel();

    if let Some((host, port)) = config.remote.clone() {
        tracing::info!("dialing remote peer {host}:{port}");
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let conn = Connection::spawn(stream, events.clone())?;
        // Optimistic join: send the handshake and treat the link as a
        // peer without waiting for the far end.
        conn.send_msg(&Message::Authenticate {
            secret: Some(config.secret.clone()),
        });
        let _ = events.send(Event::Dialed(conn));
    }

    let listener_task = tokio::spawn(accept_loop(listener, events.clone()));

    let gossip_task = {
        let events = events.clone();
        let interval = config.gossip_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick is a no-op on an empty mesh and
            // seeds the directory quickly after a dial.
            loop {
                ticker.tick().await;
                if events.send(Event::GossipTick).is_err() {
                    break;
                }
            }
        })
    };

    tracing::info!("listening on {local_addr} as {}", config.id);

    let coordinator = Coordinator::new(config, events.clone());
    let coordinator_task = tokio::spawn(coordinator.run(events_rx));

    Ok(ServerHandle {
        local_addr,
        events,
        coordinator: coordinator_task,
        listener: listener_task,
        gossip: gossip_task,
    })
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!("accepted {addr}");
                match Connection::spawn(stream, events.clone()) {
                    Ok(conn) => {
                        if events.send(Event::Accepted(conn)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("failed to adopt socket from {addr}: {e}"),
                }
            }
            // A failing accept means the socket is going away; that is
            // the shutdown signal, not a retryable error.
            Err(e) => {
                tracing::debug!("accept ended: {e}");
                break;
            }
        }
    }
}

/// Run until interrupted.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let handle = spawn(config).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    handle.shutdown();
    handle.join().await;
    Ok(())
}
