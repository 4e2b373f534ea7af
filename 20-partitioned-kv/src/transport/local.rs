//! In-process transport: messengers call straight into the target node.
//!
//! Nodes register under their id. The network only keeps weak references, so
//! dropping a node is enough to make it unreachable; [`LocalNetwork::detach`]
//! does the same thing explicitly, which is how tests simulate a crash.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::message::{Message, PeerId};
use crate::messenger::{stamp_commit, Messenger, TransportError};
use crate::node::Node;

#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<PeerId, Weak<Node>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messenger(self: &Arc<Self>, self_id: impl Into<PeerId>) -> Arc<dyn Messenger> {
        Arc::new(LocalMessenger {
            self_id: self_id.into(),
            network: Arc::clone(self),
        })
    }

    pub fn register(&self, node: &Arc<Node>) {
        self.nodes
            .write()
            .insert(node.id().to_string(), Arc::downgrade(node));
    }

    /// Makes `id` unreachable without telling anyone. Returns whether it was registered.
    pub fn detach(&self, id: &str) -> bool {
        self.nodes.write().remove(id).is_some()
    }

    fn lookup(&self, id: &str) -> Result<Arc<Node>, TransportError> {
        self.nodes
            .read()
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(id.to_string()))
    }
}

pub struct LocalMessenger {
    self_id: PeerId,
    network: Arc<LocalNetwork>,
}

impl LocalMessenger {
    fn deliver(&self, peer: &str, message: Message) -> Result<Option<Message>, TransportError> {
        let node = self.network.lookup(peer)?;
        Ok(node.handle_peer_message(message))
    }
}

#[async_trait]
impl Messenger for LocalMessenger {
    async fn get_value_for_key(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError> {
        self.deliver(peer, message.clone())
    }

    async fn request_acknowledgement(
        &self,
        message: &Message,
        peer: &str,
    ) -> Result<Option<Message>, TransportError> {
        self.deliver(peer, message.clone())
    }

    async fn get_all_data(&self, peer: &str) -> Result<Option<Message>, TransportError> {
        self.deliver(peer, Message::Store)
    }

    async fn delete_key(&self, message: &Message, peer: &str) -> Result<(), TransportError> {
        self.deliver(peer, message.clone()).map(|_| ())
    }

    async fn commit_key(&self, message: &Message, peer: &str) -> Result<(), TransportError> {
        self.deliver(peer, stamp_commit(message, &self.self_id))
            .map(|_| ())
    }

    async fn exit(&self, peer: &str) -> Result<(), TransportError> {
        let exit = Message::Exit {
            peer: Some(self.self_id.clone()),
        };
        self.deliver(peer, exit).map(|_| ())
    }
}
