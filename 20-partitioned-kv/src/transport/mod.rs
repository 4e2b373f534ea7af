//! Transports: each one pairs a [`Messenger`] for outbound calls with a
//! listener that decodes inbound traffic and hands it to
//! [`Node::handle_peer_message`].
//!
//! - [`tcp`]: newline-terminated text over short-lived TCP connections
//! - [`udp`]: one datagram per message
//! - [`rpc`]: JSON-encoded calls naming the messenger operation
//! - [`local`]: in-process calls, for tests and embedding

pub mod local;
pub mod rpc;
pub mod tcp;
pub mod udp;

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::ValueEnum;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::select;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::message::PeerId;
use crate::messenger::Messenger;
use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Tcp,
    Udp,
    Rpc,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Tcp => "tcp",
            Mode::Udp => "udp",
            Mode::Rpc => "rpc",
        })
    }
}

/// Builds the outbound side of a transport for a node advertised as `self_id`.
pub fn messenger(mode: Mode, self_id: PeerId) -> Arc<dyn Messenger> {
    match mode {
        Mode::Tcp => Arc::new(tcp::TcpMessenger::new(self_id)),
        Mode::Udp => Arc::new(udp::UdpMessenger::new(self_id)),
        Mode::Rpc => Arc::new(rpc::RpcMessenger::new(self_id)),
    }
}

/// A bound, not yet serving, listening resource.
pub enum Listener {
    Tcp(TcpListener),
    Udp(UdpSocket),
    Rpc(TcpListener),
}

impl Listener {
    pub async fn bind(mode: Mode, addr: &str) -> io::Result<Self> {
        Ok(match mode {
            Mode::Tcp => Listener::Tcp(TcpListener::bind(addr).await?),
            Mode::Udp => Listener::Udp(UdpSocket::bind(addr).await?),
            Mode::Rpc => Listener::Rpc(TcpListener::bind(addr).await?),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Tcp(listener) | Listener::Rpc(listener) => listener.local_addr(),
            Listener::Udp(socket) => socket.local_addr(),
        }
    }

    /// Starts the receive loop. It runs until the node is closed, at which
    /// point in-flight handlers are aborted and the socket is released.
    ///
    /// At most `peer_count + 1` messages are handled at once. Stream
    /// transports take a permit per decoded line, so an idle connection
    /// never holds one.
    pub fn serve(self, node: Arc<Node>) -> JoinHandle<()> {
        let workers = Arc::new(Semaphore::new(node.agreement().peer_count() + 1));
        match self {
            Listener::Tcp(listener) => {
                tokio::spawn(serve_connections(listener, node, workers, tcp::handle_connection))
            }
            Listener::Rpc(listener) => {
                tokio::spawn(serve_connections(listener, node, workers, rpc::handle_connection))
            }
            Listener::Udp(socket) => tokio::spawn(udp::serve(socket, node, workers)),
        }
    }
}

/// Accept loop shared by the stream transports.
async fn serve_connections<H, Fut>(
    listener: TcpListener,
    node: Arc<Node>,
    workers: Arc<Semaphore>,
    handle: H,
) where
    H: Fn(TcpStream, Arc<Node>, Arc<Semaphore>) -> Fut,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    let stopped = node.stopped();
    tokio::pin!(stopped);
    let mut connections = JoinSet::new();

    loop {
        while connections.try_join_next().is_some() {}

        select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let connection = handle(stream, Arc::clone(&node), Arc::clone(&workers));
                    let id = node.id().to_string();
                    connections.spawn(async move {
                        if let Err(err) = connection.await {
                            debug!(
                                node = %id,
                                peer = %remote,
                                error = ?err,
                                "peer connection closed with error"
                            );
                        }
                    });
                }
                Err(err) => {
                    warn!(node = %node.id(), error = ?err, "failed to accept peer connection")
                }
            },
        }
    }

    connections.abort_all();
    debug!(node = %node.id(), "listener stopped");
}

/// Waits for a handler slot on behalf of one decoded message.
pub(crate) async fn acquire_worker(workers: &Arc<Semaphore>) -> io::Result<OwnedSemaphorePermit> {
    Arc::clone(workers)
        .acquire_owned()
        .await
        .map_err(|_| io::Error::other("worker pool closed"))
}
