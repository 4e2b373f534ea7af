//! A single store node: lifecycle, acceptor dispatch for peer traffic, and
//! the operator-facing operations that drive ownership negotiation.
//!
//! # Concurrency
//!
//! Inbound peer messages are handled by many workers at once while the
//! operator issues one command at a time. [`Store`] and [`Agreement`] each
//! guard their state with a lock and never hold it across an `await`. Local
//! PUT negotiations are additionally serialized by a per-node gate, so at
//! most one proposal from this node is in flight.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agreement::Agreement;
use crate::message::{Key, Message, PeerId, Value};
use crate::messenger::{Messenger, TransportError};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Constructed, not yet accepting traffic.
    Ready,
    /// Listening; every operation is available.
    Running,
    /// Terminal.
    Stopped,
}

/// Outcomes of operator commands that did not succeed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("key not present here")]
    KeyNotLocal,
    #[error("could not get data from peer")]
    PeerUnreachable,
    #[error("cannot write data")]
    CannotWrite,
    #[error("node is not running")]
    NotRunning,
    #[error("cannot move node from {from:?} to {to:?}")]
    InvalidTransition { from: NodeState, to: NodeState },
}

/// Point-in-time summary of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: PeerId,
    pub state: NodeState,
    pub peers: Vec<PeerId>,
    pub majority: usize,
    pub local_keys: usize,
    pub remote_keys: usize,
}

/// One member of the store. Shared as `Arc<Node>` between the operator
/// console and the transport listener.
pub struct Node {
    id: PeerId,
    state: Mutex<NodeState>,
    store: Store,
    agreement: Agreement,
    messenger: Arc<dyn Messenger>,
    peer_timeout: Duration,
    proposals: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    /// Builds a node in the Ready state. `peers` may include `id` itself; it
    /// is filtered out.
    pub fn new(
        id: impl Into<PeerId>,
        peers: impl IntoIterator<Item = PeerId>,
        messenger: Arc<dyn Messenger>,
        peer_timeout: Duration,
    ) -> Self {
        let id = id.into();
        let agreement = Agreement::new(peers.into_iter().filter(|peer| *peer != id));
        let (shutdown, _) = watch::channel(false);
        Self {
            id,
            state: Mutex::new(NodeState::Ready),
            store: Store::new(),
            agreement,
            messenger,
            peer_timeout,
            proposals: tokio::sync::Mutex::new(()),
            shutdown,
        }
    }

    /// Identity advertised to peers.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn agreement(&self) -> &Agreement {
        &self.agreement
    }

    /// Snapshot of lifecycle state, membership and key counts.
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            state: self.state(),
            peers: self.agreement.peers(),
            majority: self.agreement.majority(),
            local_keys: self.store.local_len(),
            remote_keys: self.store.remote_len(),
        }
    }

    /// Ready -> Running. Called once the transport is bound.
    pub fn start(&self) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        if *state != NodeState::Ready {
            return Err(NodeError::InvalidTransition {
                from: *state,
                to: NodeState::Running,
            });
        }
        *state = NodeState::Running;
        info!(node = %self.id, peers = ?self.agreement.peers(), majority = self.agreement.majority(), "node running");
        Ok(())
    }

    /// Moves the node to Stopped and signals listeners to release their
    /// resources. Returns `false` if it was already stopped.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state == NodeState::Stopped {
                return false;
            }
            *state = NodeState::Stopped;
        }
        self.shutdown.send_replace(true);
        info!(node = %self.id, "shutting down");
        true
    }

    /// Resolves once the node has been closed.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        match self.state() {
            NodeState::Running => Ok(()),
            _ => Err(NodeError::NotRunning),
        }
    }

    /// Applies one message received from a peer and returns the reply, if
    /// that kind has one.
    pub fn handle_peer_message(&self, message: Message) -> Option<Message> {
        if self.state() != NodeState::Running {
            debug!(node = %self.id, kind = message.keyword(), "dropping peer message, node not running");
            return None;
        }

        match message {
            Message::Get { key } => self
                .store
                .get(&key)
                .ok()
                .map(|value| Message::Data { key, value }),
            Message::Del { key } => {
                self.store.remove_peer_for_key(&key);
                self.agreement.clear_voted(&key);
                None
            }
            Message::Store => Some(Message::DataAll {
                entries: self.store.snapshot_all(),
            }),
            Message::Owner { key } => {
                // Mark first: a promise is made whichever way we answer.
                let fresh = self.agreement.mark_voted(&key);
                if fresh && !self.store.has_key(&key) {
                    debug!(node = %self.id, key = %key, "acking ownership claim");
                    Some(Message::Ack { key })
                } else {
                    debug!(node = %self.id, key = %key, "rejecting ownership claim");
                    Some(Message::Nak { key })
                }
            }
            Message::Commit { key, peer } => {
                if !self.store.set_peer_for_key(key.clone(), peer.clone()) {
                    warn!(node = %self.id, key = %key, owner = %peer, "ignoring commit for a key that already has an owner");
                }
                self.agreement.clear_voted(&key);
                None
            }
            Message::Exit { peer: Some(peer) } => {
                let purged = self.store.remove_peer(&peer);
                self.agreement.remove_peer(&peer);
                info!(
                    node = %self.id,
                    peer = %peer,
                    purged,
                    majority = self.agreement.majority(),
                    "peer left"
                );
                None
            }
            other => {
                warn!(node = %self.id, message = %other, "unsupported message type received");
                None
            }
        }
    }

    /// Runs a peer call with the node's deadline. Failures and timeouts are
    /// logged and come back as `None`.
    async fn bounded<T>(
        &self,
        peer: &str,
        op: &'static str,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.peer_timeout, call).await {
            Ok(Ok(answer)) => Some(answer),
            Ok(Err(err)) => {
                warn!(node = %self.id, peer = %peer, op, error = %err, "peer request failed");
                None
            }
            Err(_) => {
                warn!(node = %self.id, peer = %peer, op, timeout = ?self.peer_timeout, "peer did not answer in time");
                None
            }
        }
    }

    /// Reads `key` from the local store, or forwards the read to the peer
    /// registered as its owner.
    ///
    /// Fails with [`NodeError::KeyNotLocal`] when no owner is known and with
    /// [`NodeError::PeerUnreachable`] when the owner does not answer with data.
    pub async fn get(&self, key: &str) -> Result<Value, NodeError> {
        self.ensure_running()?;
        if let Ok(value) = self.store.get(key) {
            return Ok(value);
        }
        let Some(owner) = self.store.peer_for_key(key) else {
            return Err(NodeError::KeyNotLocal);
        };

        let request = Message::Get {
            key: key.to_string(),
        };
        match self
            .bounded(&owner, "GET", self.messenger.get_value_for_key(&request, &owner))
            .await
        {
            Some(Some(Message::Data { value, .. })) => Ok(value),
            _ => Err(NodeError::PeerUnreachable),
        }
    }

    /// Writes `key`. Keys this node owns are overwritten in place; unclaimed
    /// keys are negotiated with the peers first.
    pub async fn put(&self, key: Key, value: Value) -> Result<(), NodeError> {
        self.ensure_running()?;
        let _gate = self.proposals.lock().await;

        if self.store.has_locally(&key) {
            return self
                .store
                .put(key, value)
                .map_err(|_| NodeError::KeyNotLocal);
        }
        if self.store.has_remotely(&key) {
            return Err(NodeError::KeyNotLocal);
        }
        self.negotiate(key, value).await
    }

    async fn negotiate(&self, key: Key, value: Value) -> Result<(), NodeError> {
        if !self.agreement.mark_voted(&key) {
            info!(node = %self.id, key = %key, "key is promised to another proposer");
            return Err(NodeError::CannotWrite);
        }

        let peers = self.agreement.peers();
        let claim = Message::Owner { key: key.clone() };
        let replies = join_all(peers.iter().map(|peer| {
            self.bounded(peer, "OWNER", self.messenger.request_acknowledgement(&claim, peer))
        }))
        .await;

        for (peer, reply) in peers.iter().zip(replies) {
            match reply.flatten() {
                Some(Message::Ack { key: acked }) if acked == key => {
                    self.agreement.record_ack(&key)
                }
                Some(Message::Nak { key: refused }) if refused == key => {
                    self.agreement.record_nak(&key)
                }
                other => {
                    debug!(node = %self.id, peer = %peer, key = %key, reply = ?other, "counting as abstention")
                }
            }
        }

        let tally = self.agreement.tally(&key);
        let committed =
            self.agreement.has_majority(&key) && self.store.put(key.clone(), value).is_ok();

        if committed {
            let commit = Message::Commit {
                key: key.clone(),
                peer: self.id.clone(),
            };
            join_all(peers.iter().map(|peer| {
                self.bounded(peer, "COMMIT", self.messenger.commit_key(&commit, peer))
            }))
            .await;
        }

        self.agreement.reset_counters(&key);
        self.agreement.clear_voted(&key);

        if committed {
            info!(node = %self.id, key = %key, acks = tally.acks, naks = tally.naks, "claimed key");
            Ok(())
        } else {
            warn!(
                node = %self.id,
                key = %key,
                acks = tally.acks,
                naks = tally.naks,
                majority = self.agreement.majority(),
                "ownership claim rejected"
            );
            Err(NodeError::CannotWrite)
        }
    }

    /// Deletes a key this node owns and tells every peer to forget it.
    pub async fn delete(&self, key: &str) -> Result<(), NodeError> {
        self.ensure_running()?;
        self.store
            .delete(key)
            .map_err(|_| NodeError::KeyNotLocal)?;

        let peers = self.agreement.peers();
        let notice = Message::Del {
            key: key.to_string(),
        };
        join_all(
            peers
                .iter()
                .map(|peer| self.bounded(peer, "DEL", self.messenger.delete_key(&notice, peer))),
        )
        .await;
        info!(node = %self.id, key = %key, "deleted key");
        Ok(())
    }

    /// Read-only export of every reachable node's local entries.
    pub async fn store_all(&self) -> Result<BTreeMap<Key, Value>, NodeError> {
        self.ensure_running()?;
        let mut merged = self.store.snapshot_all();

        let peers = self.agreement.peers();
        let dumps = join_all(
            peers
                .iter()
                .map(|peer| self.bounded(peer, "STORE", self.messenger.get_all_data(peer))),
        )
        .await;

        for (peer, dump) in peers.iter().zip(dumps) {
            match dump.flatten() {
                Some(Message::DataAll { entries }) => merged.extend(entries),
                other => debug!(node = %self.id, peer = %peer, reply = ?other, "no data from peer"),
            }
        }
        Ok(merged)
    }

    /// Tells every peer this node is leaving, then stops it. Calling it on a
    /// node that is not running only closes it.
    pub async fn exit(&self) {
        if self.state() == NodeState::Running {
            let peers = self.agreement.peers();
            join_all(
                peers
                    .iter()
                    .map(|peer| self.bounded(peer, "EXIT", self.messenger.exit(peer))),
            )
            .await;
        }
        self.close();
    }
}
