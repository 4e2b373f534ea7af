//! The contract every transport implements so a [`Node`](crate::node::Node)
//! can talk to its peers without knowing how bytes move.

use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::message::{DecodeError, Message, PeerId};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad reply: {0}")]
    Decode(#[from] DecodeError),
    #[error("rpc encoding error: {0}")]
    Rpc(#[from] serde_json::Error),
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("peer reported an error: {0}")]
    Remote(String),
    #[error("message of {0} bytes does not fit in a datagram")]
    Oversized(usize),
}

/// Delivers messages to peers and, for request/response kinds, hands back
/// the peer's answer. `Ok(None)` means the peer had nothing to say (for
/// example a GET for a key it does not own).
///
/// Implementations know their own advertised identity; it is stamped on
/// COMMIT and EXIT so receivers learn who sent them.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Sends a GET and returns the owner's DATA reply.
    async fn get_value_for_key(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError>;

    /// Sends an OWNER claim; the peer answers ACK or NAK.
    async fn request_acknowledgement(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError>;

    /// Asks for every entry the peer owns, answered with DATA_ALL.
    async fn get_all_data(&self, peer: &str) -> Result<Option<Message>, TransportError>;

    /// Notifies the peer that a key was deleted. No reply.
    async fn delete_key(&self, message: &Message, peer: &str) -> Result<(), TransportError>;

    /// Announces a won claim. The owner field is replaced with this
    /// messenger's own identity before sending.
    async fn commit_key(&self, message: &Message, peer: &str) -> Result<(), TransportError>;

    /// Tells the peer this node is leaving.
    async fn exit(&self, peer: &str) -> Result<(), TransportError>;
}

/// Rewrites the owner of a COMMIT to `self_id`.
pub(crate) fn stamp_commit(message: &Message, self_id: &str) -> Message {
    match message {
        Message::Commit { key, .. } => Message::Commit {
            key: key.clone(),
            peer: self_id.to_string(),
        },
        other => other.clone(),
    }
}

/// Decodes one reply line from a text transport. An empty line is "no answer".
pub(crate) fn decode_reply(line: &str) -> Result<Option<Message>, TransportError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if let Some(reason) = line.strip_prefix("ERROR: ") {
        return Err(TransportError::Remote(reason.to_string()));
    }
    Ok(Some(line.parse()?))
}
