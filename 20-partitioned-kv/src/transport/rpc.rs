//! Remote calls over TCP: the request names the messenger operation and
//! carries the message as structured JSON rather than wire text.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::message::{Message, PeerId};
use crate::messenger::{stamp_commit, Messenger, TransportError};
use crate::node::Node;
use crate::transport::acquire_worker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RpcCall {
    GetValueForKey { caller: PeerId, message: Message },
    RequestAcknowledgement { caller: PeerId, message: Message },
    GetAllData { caller: PeerId },
    DeleteKey { caller: PeerId, message: Message },
    CommitKey { caller: PeerId, message: Message },
    Exit { caller: PeerId },
}

impl RpcCall {
    pub fn caller(&self) -> &str {
        match self {
            RpcCall::GetValueForKey { caller, .. }
            | RpcCall::RequestAcknowledgement { caller, .. }
            | RpcCall::GetAllData { caller }
            | RpcCall::DeleteKey { caller, .. }
            | RpcCall::CommitKey { caller, .. }
            | RpcCall::Exit { caller } => caller,
        }
    }

    /// The message the receiving node applies for this call.
    pub fn into_message(self) -> Message {
        match self {
            RpcCall::GetValueForKey { message, .. }
            | RpcCall::RequestAcknowledgement { message, .. }
            | RpcCall::DeleteKey { message, .. }
            | RpcCall::CommitKey { message, .. } => message,
            RpcCall::GetAllData { .. } => Message::Store,
            RpcCall::Exit { caller } => Message::Exit { peer: Some(caller) },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct RpcMessenger {
    self_id: PeerId,
}

impl RpcMessenger {
    pub fn new(self_id: PeerId) -> Self {
        Self { self_id }
    }

    async fn call(&self, peer: &str, call: RpcCall) -> Result<Option<Message>, TransportError> {
        let stream = TcpStream::connect(peer).await?;
        let (reader, mut writer) = stream.into_split();

        let mut request = serde_json::to_vec(&call)?;
        request.push(b'\n');
        writer.write_all(&request).await?;
        writer.flush().await?;

        let mut line = String::new();
        BufReader::new(reader).read_line(&mut line).await?;
        if line.trim().is_empty() {
            return Err(TransportError::Unreachable(peer.to_string()));
        }

        let reply: RpcReply = serde_json::from_str(line.trim())?;
        match reply.error {
            Some(reason) => Err(TransportError::Remote(reason)),
            None => Ok(reply.message),
        }
    }
}

#[async_trait]
impl Messenger for RpcMessenger {
    async fn get_value_for_key(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError> {
        let call = RpcCall::GetValueForKey {
            caller: self.self_id.clone(),
            message: message.clone(),
        };
        self.call(peer, call).await
    }

    async fn request_acknowledgement(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError> {
        let call = RpcCall::RequestAcknowledgement {
            caller: self.self_id.clone(),
            message: message.clone(),
        };
        self.call(peer, call).await
    }

    async fn get_all_data(&self, peer: &str) -> Result<Option<Message>, TransportError> {
        let call = RpcCall::GetAllData {
            caller: self.self_id.clone(),
        };
        self.call(peer, call).await
    }

    async fn delete_key(&self, message: &Message, peer: &str) -> Result<(), TransportError> {
        let call = RpcCall::DeleteKey {
            caller: self.self_id.clone(),
            message: message.clone(),
        };
        self.call(peer, call).await.map(|_| ())
    }

    async fn commit_key(&self, message: &Message, peer: &str) -> Result<(), TransportError> {
        let call = RpcCall::CommitKey {
            caller: self.self_id.clone(),
            message: stamp_commit(message, &self.self_id),
        };
        self.call(peer, call).await.map(|_| ())
    }

    async fn exit(&self, peer: &str) -> Result<(), TransportError> {
        let call = RpcCall::Exit {
            caller: self.self_id.clone(),
        };
        self.call(peer, call).await.map(|_| ())
    }
}

/// Every call gets exactly one reply line, including notifications, so the
/// caller always learns whether the peer accepted the request.
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
        let reply = match serde_json::from_str::<RpcCall>(&line) {
            Ok(call) => RpcReply {
                message: node.handle_peer_message(call.into_message()),
                error: None,
            },
            Err(err) => {
                warn!(node = %node.id(), error = %err, "undecodable rpc call");
                RpcReply {
                    message: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let mut encoded = serde_json::to_vec(&reply)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    Ok(())
}
