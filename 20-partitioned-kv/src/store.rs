//! Partitioned key-value storage.
//!
//! A node keeps two maps: values for the keys it owns, and the owning peer
//! for keys claimed elsewhere. Both maps sit behind one lock so a key can
//! never be observed in both at once.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use thiserror::Error;

use crate::message::{Key, PeerId, Value};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key {0} is owned by someone else")]
    OwnedElsewhere(Key),
    #[error("key {0} is not present locally")]
    NotLocal(Key),
}

#[derive(Default)]
struct Partitions {
    local: BTreeMap<Key, Value>,
    remote: HashMap<Key, PeerId>,
}

/// Thread-safe store shared by the operator path and every inbound handler.
#[derive(Default)]
pub struct Store {
    partitions: RwLock<Partitions>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a locally owned value. Fails if the key is registered to a peer.
    pub fn put(&self, key: Key, value: Value) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write();
        if partitions.remote.contains_key(&key) {
            return Err(StoreError::OwnedElsewhere(key));
        }
        partitions.local.insert(key, value);
        Ok(())
    }

    /// Reads a locally owned value. Keys registered to peers are not visible here.
    pub fn get(&self, key: &str) -> Result<Value, StoreError> {
        self.partitions
            .read()
            .local
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotLocal(key.to_string()))
    }

    /// Removes a locally owned key and returns its last value.
    pub fn delete(&self, key: &str) -> Result<Value, StoreError> {
        self.partitions
            .write()
            .local
            .remove(key)
            .ok_or_else(|| StoreError::NotLocal(key.to_string()))
    }

    /// True if this node owns `key`.
    pub fn has_locally(&self, key: &str) -> bool {
        self.partitions.read().local.contains_key(key)
    }

    /// True if `key` is registered to some peer.
    pub fn has_remotely(&self, key: &str) -> bool {
        self.partitions.read().remote.contains_key(key)
    }

    /// True if `key` is owned anywhere this node knows of.
    pub fn has_key(&self, key: &str) -> bool {
        let partitions = self.partitions.read();
        partitions.local.contains_key(key) || partitions.remote.contains_key(key)
    }

    /// The peer registered as owner of `key`, if any.
    pub fn peer_for_key(&self, key: &str) -> Option<PeerId> {
        self.partitions.read().remote.get(key).cloned()
    }

    /// Records `peer` as the owner of `key`. The first registration wins; a
    /// later one for the same key, or one for a key held locally, is ignored.
    ///
    /// Returns whether the registration took effect.
    pub fn set_peer_for_key(&self, key: Key, peer: PeerId) -> bool {
        let mut partitions = self.partitions.write();
        if partitions.local.contains_key(&key) || partitions.remote.contains_key(&key) {
            return false;
        }
        partitions.remote.insert(key, peer);
        true
    }

    /// Drops the owner registration for `key`. Locally owned keys are untouched.
    pub fn remove_peer_for_key(&self, key: &str) -> Option<PeerId> {
        self.partitions.write().remote.remove(key)
    }

    /// Forgets every key owned by `peer`, returning how many were dropped.
    pub fn remove_peer(&self, peer: &str) -> usize {
        let mut partitions = self.partitions.write();
        let before = partitions.remote.len();
        partitions.remote.retain(|_, owner| owner != peer);
        before - partitions.remote.len()
    }

    /// Copy of the locally owned entries.
    pub fn snapshot_all(&self) -> BTreeMap<Key, Value> {
        self.partitions.read().local.clone()
    }

    /// Remote registrations grouped by owner, each key list sorted.
    pub fn keys_per_peer(&self) -> BTreeMap<PeerId, Vec<Key>> {
        let mut mapping: BTreeMap<PeerId, Vec<Key>> = BTreeMap::new();
        for (key, peer) in self.partitions.read().remote.iter() {
            mapping.entry(peer.clone()).or_default().push(key.clone());
        }
        for keys in mapping.values_mut() {
            keys.sort();
        }
        mapping
    }

    /// Number of keys this node owns.
    pub fn local_len(&self) -> usize {
        self.partitions.read().local.len()
    }

    /// Number of keys registered to peers.
    pub fn remote_len(&self) -> usize {
        self.partitions.read().remote.len()
    }
}
