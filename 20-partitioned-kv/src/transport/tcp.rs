//! Line-oriented text over TCP.
//!
//! Each outbound message opens a connection, writes one line and, when the
//! kind expects an answer, reads exactly one line back. An empty reply line
//! means the peer had no answer; `ERROR: ...` reports a decode failure.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::message::{Message, PeerId};
use crate::messenger::{decode_reply, stamp_commit, Messenger, TransportError};
use crate::node::Node;
use crate::transport::acquire_worker;

pub struct TcpMessenger {
    self_id: PeerId,
}

impl TcpMessenger {
    pub fn new(self_id: PeerId) -> Self {
        Self { self_id }
    }

    async fn exchange(
        &self,
        peer: &str,
        message: &Message,
    ) -> Result<Option<Message>, TransportError> {
        let stream = TcpStream::connect(peer).await?;
        let (reader, mut writer) = stream.into_split();

        writer.write_all(format!("{message}\n").as_bytes()).await?;
        writer.flush().await?;
        if !message.expects_reply() {
            writer.shutdown().await?;
            return Ok(None);
        }

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await?;
        decode_reply(&line)
    }
}

#[async_trait]
impl Messenger for TcpMessenger {
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

/// Serves every line a peer writes on one connection until it hangs up.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    node: Arc<Node>,
    workers: Arc<Semaphore>,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let _permit = acquire_worker(&workers).await?;
        let reply = match line.parse::<Message>() {
            Ok(message) => {
                if !message.expects_reply() {
                    node.handle_peer_message(message);
                    continue;
                }
                node.handle_peer_message(message)
                    .map(|reply| reply.to_string())
                    .unwrap_or_default()
            }
            Err(err) => {
                warn!(node = %node.id(), error = %err, "undecodable peer message");
                format!("ERROR: {err}")
            }
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
