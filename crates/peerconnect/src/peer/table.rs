//! Peer table
//!
//! Owned by the control loop and only mutated on the owning context, so it
//! needs no locking. Every entry carries the generation it was created
//! with; work posted for a peer names that generation and is dropped when
//! the entry has since been removed or replaced.

use super::connection::Peer;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

/// Liveness token of one peer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Live peers keyed by remote id
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
    next_generation: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh generation for a peer about to be created
    pub fn next_generation(&mut self) -> Generation {
        self.next_generation += 1;
        Generation(self.next_generation)
    }

    /// Add a peer
    ///
    /// # Errors
    ///
    /// Returns `PeerExists` if a live peer with the same remote id exists.
    pub fn insert(&mut self, peer: Peer) -> Result<()> {
        if self.peers.contains_key(peer.remote_id()) {
            return Err(Error::PeerExists(peer.remote_id().to_string()));
        }

        info!(peer_id = %peer.remote_id(), generation = %peer.generation(), "Adding peer");
        self.peers.insert(peer.remote_id().to_string(), peer);
        Ok(())
    }

    pub fn get(&self, remote_id: &str) -> Option<&Peer> {
        self.peers.get(remote_id)
    }

    /// The peer for `remote_id`, only if it is still generation `generation`
    pub fn get_live_mut(&mut self, remote_id: &str, generation: Generation) -> Option<&mut Peer> {
        match self.peers.get_mut(remote_id) {
            Some(peer) if peer.generation() == generation => Some(peer),
            Some(peer) => {
                debug!(
                    peer_id = remote_id,
                    stale = %generation,
                    live = %peer.generation(),
                    "Ignoring work for replaced peer"
                );
                None
            }
            None => None,
        }
    }

    /// Remove the peer for `remote_id` if it is still generation `generation`
    pub fn remove_live(&mut self, remote_id: &str, generation: Generation) -> Option<Peer> {
        self.get_live_mut(remote_id, generation)?;
        let peer = self.peers.remove(remote_id);
        if peer.is_some() {
            info!(peer_id = remote_id, %generation, "Removed peer");
        }
        peer
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.peers.contains_key(remote_id)
    }

    /// Remote ids of every live peer
    pub fn ids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Remove every peer
    pub fn drain(&mut self) -> Vec<Peer> {
        self.peers.drain().map(|(_, peer)| peer).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::BufferGauge;
    use crate::testing::FakeEngine;
    use std::sync::Arc;

    fn peer(table: &mut PeerTable, remote_id: &str) -> Peer {
        let generation = table.next_generation();
        Peer::new(
            "alice",
            remote_id,
            generation,
            Arc::new(FakeEngine::default()),
            Arc::new(BufferGauge::new()),
            1024,
        )
    }

    #[test]
    fn test_generations_are_unique() {
        let mut table = PeerTable::new();
        let a = table.next_generation();
        let b = table.next_generation();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_insert_rejects_duplicate_remote_id() {
        let mut table = PeerTable::new();
        let first = peer(&mut table, "bob");
        let second = peer(&mut table, "bob");

        table.insert(first).unwrap();
        let err = table.insert(second).unwrap_err();
        assert!(matches!(err, Error::PeerExists(id) if id == "bob"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut table = PeerTable::new();
        let old = peer(&mut table, "bob");
        let old_generation = old.generation();
        table.insert(old).unwrap();
        assert!(table.remove_live("bob", old_generation).is_some());

        let new = peer(&mut table, "bob");
        let new_generation = new.generation();
        table.insert(new).unwrap();

        assert!(table.get_live_mut("bob", old_generation).is_none());
        assert!(table.remove_live("bob", old_generation).is_none());
        assert!(table.contains("bob"));
        assert!(table.remove_live("bob", new_generation).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_and_drain() {
        let mut table = PeerTable::new();
        for id in ["bob", "carol"] {
            let p = peer(&mut table, id);
            table.insert(p).unwrap();
        }

        let mut ids = table.ids();
        ids.sort();
        assert_eq!(ids, vec!["bob", "carol"]);

        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
