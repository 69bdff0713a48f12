//! Peer metadata and score-based ranking.

use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
};

use crate::node::{NodeAddress, NodeId};

/// Effective peer score; higher ranks earlier.
pub type PeerScore = i16;

/// Score assigned to persistent peers.
pub const PEER_SCORE_PERSISTENT: PeerScore = PeerScore::MAX;

/// Ceiling for scores earned through behavior alone.
pub const MAX_PEER_SCORE_NOT_PERSISTENT: PeerScore = PEER_SCORE_PERSISTENT - 1;

/// Dialing bookkeeping for one known address of a peer.
#[derive(Clone, Debug)]
pub struct AddressInfo {
    pub address: NodeAddress,
    pub dial_failures: u32,
    pub last_dial_failure: Option<Instant>,
    pub last_dial_success: Option<Instant>,
}

impl AddressInfo {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            address,
            dial_failures: 0,
            last_dial_failure: None,
            last_dial_success: None,
        }
    }
}

/// Everything the manager knows about one peer.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: NodeId,
    pub persistent: bool,
    /// Operator-assigned score; positive values override everything else.
    pub fixed_score: PeerScore,
    pub mutable_score: PeerScore,
    pub inactive: bool,
    pub last_connected: Option<Instant>,
    pub last_disconnected: Option<Instant>,
    pub address_info: BTreeMap<NodeAddress, AddressInfo>,
}

impl PeerInfo {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            persistent: false,
            fixed_score: 0,
            mutable_score: 0,
            inactive: false,
            last_connected: None,
            last_disconnected: None,
            address_info: BTreeMap::new(),
        }
    }

    /// Track an address for this peer. Existing bookkeeping is kept.
    pub fn add_address(&mut self, address: NodeAddress) -> bool {
        if self.address_info.contains_key(&address) {
            return false;
        }
        self.address_info
            .insert(address.clone(), AddressInfo::new(address));
        true
    }

    /// Effective score: fixed if set, the persistent constant for
    /// persistent peers, otherwise the clamped mutable score minus
    /// accumulated dial failures.
    pub fn score(&self) -> PeerScore {
        if self.fixed_score > 0 {
            return self.fixed_score;
        }
        if self.persistent {
            return PEER_SCORE_PERSISTENT;
        }

        let mut score = i64::from(self.mutable_score).min(i64::from(MAX_PEER_SCORE_NOT_PERSISTENT));
        for info in self.address_info.values() {
            score -= i64::from(info.dial_failures);
        }
        score.max(i64::from(PeerScore::MIN)) as PeerScore
    }
}

/// In-memory peer registry: the primary map, a reverse address index, and a
/// cached ranking that is invalidated whenever a write can change ordering.
#[derive(Default)]
pub struct PeerStore {
    peers: HashMap<NodeId, PeerInfo>,
    index: HashMap<NodeAddress, NodeId>,
    ranked: Option<Vec<NodeId>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy out a peer record.
    pub fn get(&self, id: &NodeId) -> Option<PeerInfo> {
        self.peers.get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.contains_key(id)
    }

    /// Insert or replace a peer record, maintaining the address index and
    /// dropping the ranked cache if the ordering may have changed.
    pub fn set(&mut self, peer: PeerInfo) {
        let score_changed = match self.peers.get(&peer.id) {
            Some(current) => current.score() != peer.score(),
            None => true,
        };
        for address in peer.address_info.keys() {
            self.index.insert(address.clone(), peer.id);
        }
        if score_changed {
            self.ranked = None;
        }
        self.peers.insert(peer.id, peer);
    }

    /// Mutate a peer record in place, creating it first if unknown.
    pub fn update<F>(&mut self, id: NodeId, f: F)
    where
        F: FnOnce(&mut PeerInfo),
    {
        let peer = self.peers.entry(id).or_insert_with(|| PeerInfo::new(id));
        let before = peer.score();
        f(peer);
        for address in peer.address_info.keys() {
            self.index.insert(address.clone(), id);
        }
        if peer.score() != before {
            self.ranked = None;
        }
    }

    /// Peer ids ordered by score, best first. Rebuilt lazily.
    pub fn ranked(&mut self) -> Vec<NodeId> {
        if let Some(ranked) = &self.ranked {
            return ranked.clone();
        }
        let mut ranked: Vec<NodeId> = self.peers.keys().copied().collect();
        ranked.sort_by(|a, b| {
            let sa = self.peers[a].score();
            let sb = self.peers[b].score();
            sb.cmp(&sa).then_with(|| a.cmp(b))
        });
        self.ranked = Some(ranked.clone());
        ranked
    }

    /// Which peer owns this address, if any.
    pub fn resolve(&self, address: &NodeAddress) -> Option<NodeId> {
        self.index.get(address).copied()
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

    fn id(byte: u8) -> NodeId {
        NodeId::new([byte; 20])
    }

    fn addr(byte: u8, port: u16) -> NodeAddress {
        NodeAddress {
            protocol: "mconn".to_owned(),
            node_id: id(byte),
            hostname: "127.0.0.1".to_owned(),
            port,
            path: String::new(),
        }
    }

    #[test]
    fn score_prefers_fixed_then_persistent() {
        let mut peer = PeerInfo::new(id(1));
        assert_eq!(peer.score(), 0);

        peer.mutable_score = 7;
        assert_eq!(peer.score(), 7);

        peer.persistent = true;
        assert_eq!(peer.score(), PEER_SCORE_PERSISTENT);

        peer.fixed_score = 42;
        assert_eq!(peer.score(), 42);
    }

    #[test]
    fn dial_failures_drag_score_down() {
        let mut peer = PeerInfo::new(id(1));
        peer.mutable_score = 5;
        peer.add_address(addr(1, 1000));
        peer.add_address(addr(1, 1001));
        for info in peer.address_info.values_mut() {
            info.dial_failures = 4;
        }
        assert_eq!(peer.score(), -3);
    }

    #[test]
    fn score_saturates_at_i16_min() {
        let mut peer = PeerInfo::new(id(1));
        peer.mutable_score = PeerScore::MIN;
        peer.add_address(addr(1, 1000));
        peer.address_info.values_mut().next().unwrap().dial_failures = u32::MAX;
        assert_eq!(peer.score(), PeerScore::MIN);
    }

    #[test]
    fn ranked_sorts_by_score_descending() {
        let mut store = PeerStore::new();
        for (byte, score) in [(1u8, 3i16), (2, 9), (3, -2)] {
            let mut peer = PeerInfo::new(id(byte));
            peer.mutable_score = score;
            store.set(peer);
        }
        assert_eq!(store.ranked(), vec![id(2), id(1), id(3)]);
    }

    #[test]
    fn ranked_cache_invalidated_on_score_change() {
        let mut store = PeerStore::new();
        for byte in [1u8, 2] {
            store.set(PeerInfo::new(id(byte)));
        }
        let _ = store.ranked();

        store.update(id(1), |peer| peer.mutable_score = 10);
        assert_eq!(store.ranked()[0], id(1));

        store.update(id(2), |peer| peer.mutable_score = 20);
        assert_eq!(store.ranked()[0], id(2));
    }

    #[test]
    fn address_index_resolves_to_owner() {
        let mut store = PeerStore::new();
        let mut peer = PeerInfo::new(id(1));
        peer.add_address(addr(1, 1000));
        store.set(peer);

        assert_eq!(store.resolve(&addr(1, 1000)), Some(id(1)));
        assert_eq!(store.resolve(&addr(2, 2000)), None);
    }
}
