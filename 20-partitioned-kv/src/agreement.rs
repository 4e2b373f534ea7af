//! Majority agreement state: the peer set, the quorum derived from it, the
//! keys this node has promised a position on, and vote tallies for its own
//! proposals.
//!
//! All of it lives behind a single mutex so that evicting a peer and
//! recomputing the majority can never interleave with a majority check.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::message::{Key, PeerId};

/// Minimum number of acks needed to claim a key among `peer_count` peers.
///
/// A node without peers needs none.
pub fn majority_for(peer_count: usize) -> usize {
    if peer_count > 0 {
        peer_count / 2 + 1
    } else {
        0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub acks: usize,
    pub naks: usize,
}

struct AgreementState {
    peers: Vec<PeerId>,
    majority: usize,
    voted_on: HashSet<Key>,
    tallies: HashMap<Key, Tally>,
}

impl AgreementState {
    fn recompute_majority(&mut self) {
        self.majority = majority_for(self.peers.len());
    }
}

pub struct Agreement {
    state: Mutex<AgreementState>,
}

impl Agreement {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        let mut unique = Vec::new();
        for peer in peers {
            if !peer.is_empty() && !unique.contains(&peer) {
                unique.push(peer);
            }
        }
        let mut state = AgreementState {
            peers: unique,
            majority: 0,
            voted_on: HashSet::new(),
            tallies: HashMap::new(),
        };
        state.recompute_majority();
        Self {
            state: Mutex::new(state),
        }
    }

    /// Fixed copy of the current peer set.
    pub fn peers(&self) -> Vec<PeerId> {
        self.state.lock().peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn majority(&self) -> usize {
        self.state.lock().majority
    }

    /// Drops `peer` and recomputes the majority in the same critical section.
    pub fn remove_peer(&self, peer: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.peers.len();
        state.peers.retain(|known| known != peer);
        let removed = state.peers.len() != before;
        state.recompute_majority();
        removed
    }

    pub fn recompute_majority(&self) {
        self.state.lock().recompute_majority();
    }

    /// Whether the proposal for `key` has collected enough acks. Naks are
    /// tracked but never consulted.
    pub fn has_majority(&self, key: &str) -> bool {
        let state = self.state.lock();
        let acks = state.tallies.get(key).map_or(0, |tally| tally.acks);
        acks >= state.majority
    }

    pub fn record_ack(&self, key: &str) {
        self.state.lock().tallies.entry(key.to_string()).or_default().acks += 1;
    }

    pub fn record_nak(&self, key: &str) {
        self.state.lock().tallies.entry(key.to_string()).or_default().naks += 1;
    }

    pub fn tally(&self, key: &str) -> Tally {
        self.state.lock().tallies.get(key).copied().unwrap_or_default()
    }

    pub fn reset_counters(&self, key: &str) {
        self.state.lock().tallies.remove(key);
    }

    /// Marks `key` as voted on. Returns `false` if a position was already
    /// promised, which makes check-and-mark a single atomic step.
    pub fn mark_voted(&self, key: &str) -> bool {
        self.state.lock().voted_on.insert(key.to_string())
    }

    pub fn clear_voted(&self, key: &str) -> bool {
        self.state.lock().voted_on.remove(key)
    }

    pub fn has_voted(&self, key: &str) -> bool {
        self.state.lock().voted_on.contains(key)
    }
}
