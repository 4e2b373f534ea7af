//! One datagram per message.
//!
//! Requests go out from a fresh ephemeral socket so replies for concurrent
//! requests cannot be confused; the listener answers request kinds with one
//! datagram (empty when it has nothing to say).

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::message::{Message, PeerId, DATA_LIMIT};
use crate::messenger::{decode_reply, stamp_commit, Messenger, TransportError};
use crate::node::Node;

pub struct UdpMessenger {
    self_id: PeerId,
}

impl UdpMessenger {
    pub fn new(self_id: PeerId) -> Self {
        Self { self_id }
    }

    async fn exchange(
        &self,
        peer: &str,
        message: &Message,
    ) -> Result<Option<Message>, TransportError> {
        let target = lookup_host(peer)
            .await?
            .next()
            .ok_or_else(|| TransportError::Unreachable(peer.to_string()))?;
        let local: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };

        let payload = message.to_string();
        if payload.len() > DATA_LIMIT {
            return Err(TransportError::Oversized(payload.len()));
        }

        // Connected, so datagrams from anyone but `target` are dropped.
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        socket.send(payload.as_bytes()).await?;
        if !message.expects_reply() {
            return Ok(None);
        }

        let mut buf = vec![0u8; DATA_LIMIT];
        let len = socket.recv(&mut buf).await?;
        decode_reply(&String::from_utf8_lossy(&buf[..len]))
    }
}

#[async_trait]
impl Messenger for UdpMessenger {
    async fn get_value_for_key(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError> {
        self.exchange(peer, message).await
    }

    async fn request_acknowledgement(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError> {
        self.exchange(peer, message).await
    }

    async fn get_all_data(&self, peer: &str) -> Result<Option<Message>, TransportError> {
        self.exchange(peer, &Message::Store).await
    }

    async fn delete_key(&self, message: &Message, peer: &str) -> Result<(), TransportError> {
        self.exchange(peer, message).await.map(|_| ())
    }

    async fn commit_key(&self, message: &Message, peer: &str) -> Result<(), TransportError> {
        let commit = stamp_commit(message, &self.self_id);
        self.exchange(peer, &commit).await.map(|_| ())
    }

    async fn exit(&self, peer: &str) -> Result<(), TransportError> {
        let exit = Message::Exit {
            peer: Some(self.self_id.clone()),
        };
        self.exchange(peer, &exit).await.map(|_| ())
    }
}

pub(crate) async fn serve(socket: UdpSocket, node: Arc<Node>, workers: Arc<Semaphore>) {
    let socket = Arc::new(socket);
    let stopped = node.stopped();
    tokio::pin!(stopped);
    let mut tasks = JoinSet::new();
    let mut buf = vec![0u8; DATA_LIMIT];

    loop {
        while tasks.try_join_next().is_some() {}

        let permit = select! {
            _ = &mut stopped => break,
            permit = Arc::clone(&workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        select! {
            _ = &mut stopped => break,
            received = receive(&socket, &mut buf) => match received {
                Ok((datagram, remote)) => {
                    let node = Arc::clone(&node);
                    let socket = Arc::clone(&socket);
                    tasks.spawn(async move {
                        let _permit = permit;
                        handle_datagram(&datagram, remote, &socket, &node).await;
                    });
                }
                Err(err) => warn!(node = %node.id(), error = ?err, "failed to receive datagram"),
            },
        }
    }

    tasks.abort_all();
    debug!(node = %node.id(), "listener stopped");
}

async fn receive(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<(String, SocketAddr)> {
    let (len, remote) = socket.recv_from(buf).await?;
    Ok((String::from_utf8_lossy(&buf[..len]).into_owned(), remote))
}

async fn handle_datagram(datagram: &str, remote: SocketAddr, socket: &UdpSocket, node: &Node) {
    let reply = match datagram.trim().parse::<Message>() {
        Ok(message) => {
            if !message.expects_reply() {
                node.handle_peer_message(message);
                return;
            }
            node.handle_peer_message(message)
                .map(|reply| reply.to_string())
                .unwrap_or_default()
        }
        Err(err) => {
            warn!(node = %node.id(), peer = %remote, error = %err, "undecodable peer datagram");
            format!("ERROR: {err}")
        }
    };

    if reply.len() > DATA_LIMIT {
        warn!(
            node = %node.id(),
            peer = %remote,
            bytes = reply.len(),
            "reply does not fit in a datagram"
        );
        return;
    }
    if let Err(err) = socket.send_to(reply.as_bytes(), remote).await {
        warn!(node = %node.id(), peer = %remote, error = ?err, "failed to send reply");
    }
}
