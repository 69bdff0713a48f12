//! Peer lifecycle management: dialing, accepting, upgrades, eviction, and
//! retry policy.
//!
//! A peer is in at most one of `dialing`, `connected`, or `evicting` at any
//! instant. The driver loops (`dial_next`, `evict_next`) block on wakers
//! and re-run their policy decision whenever relevant state changes. All
//! state transitions happen under one mutex that is never held across an
//! await point.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use rand::Rng;
use tokio::{
    sync::{mpsc, Notify},
    time,
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    mconn::ChannelId,
    node::{NodeAddress, NodeId},
    peer_store::{PeerInfo, PeerScore, PeerStore},
    shutdown::Shutdown,
};

/// How many updates a subscriber may lag before broadcasts to it block.
const SUBSCRIPTION_BUFFER: usize = 64;

/// Direction of an established connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

/// Peer status carried by a [`PeerUpdate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeerStatus {
    /// Connected and ready.
    Up,
    /// Disconnected.
    Down,
    /// Behaved well; bump its score.
    Good,
    /// Misbehaved; drop its score.
    Bad,
}

/// Status transition broadcast to subscribers, and the event reactors
/// report back through [`PeerManager::process_peer_event`].
#[derive(Clone, Debug)]
pub struct PeerUpdate {
    pub node_id: NodeId,
    pub status: PeerStatus,
    pub channels: BTreeSet<ChannelId>,
}

impl PeerUpdate {
    pub fn new(node_id: NodeId, status: PeerStatus) -> Self {
        Self {
            node_id,
            status,
            channels: BTreeSet::new(),
        }
    }
}

/// Tunables of the peer lifecycle.
#[derive(Clone, Debug)]
pub struct PeerManagerOptions {
    pub persistent_peers: Vec<NodeId>,
    /// 0 disables the limit.
    pub max_connected: usize,
    /// Extra slots usable only while upgrading to better-scored peers.
    pub max_connected_upgrade: usize,
    /// 0 disables the limit.
    pub max_outgoing_connections: usize,
    pub min_retry_time: Duration,
    pub max_retry_time: Duration,
    pub max_retry_time_persistent: Duration,
    pub retry_time_jitter: Duration,
    /// A disconnected peer is not redialed before this has elapsed.
    pub disconnect_cooldown_period: Duration,
    /// Operator-assigned fixed scores.
    pub peer_scores: HashMap<NodeId, PeerScore>,
    /// Peers whose addresses must not be gossiped. Carried for the address
    /// exchange layer; nothing in this crate consumes it.
    pub private_peers: HashSet<NodeId>,
}

impl Default for PeerManagerOptions {
    fn default() -> Self {
        Self {
            persistent_peers: Vec::new(),
            max_connected: 64,
            max_connected_upgrade: 4,
            max_outgoing_connections: 12,
            min_retry_time: Duration::from_millis(250),
            max_retry_time: Duration::from_secs(30 * 60),
            max_retry_time_persistent: Duration::from_secs(5 * 60),
            retry_time_jitter: Duration::from_secs(5),
            disconnect_cooldown_period: Duration::from_millis(500),
            peer_scores: HashMap::new(),
            private_peers: HashSet::new(),
        }
    }
}

impl PeerManagerOptions {
    /// How long to wait before retrying an address that failed `failures`
    /// times. `None` means never (retries disabled).
    fn retry_delay(&self, failures: u32, persistent: bool) -> Option<Duration> {
        if failures == 0 {
            return Some(Duration::ZERO);
        }
        if self.min_retry_time.is_zero() {
            return None;
        }

        let max_delay = if persistent && !self.max_retry_time_persistent.is_zero() {
            self.max_retry_time_persistent
        } else {
            self.max_retry_time
        };

        // Saturate: a large failure count must clamp, not overflow.
        let mut delay = self
            .min_retry_time
            .checked_mul(failures)
            .unwrap_or(max_delay);
        if !self.retry_time_jitter.is_zero() {
            let jitter = rand::thread_rng().gen_range(0..self.retry_time_jitter.as_nanos() as u64);
            delay = delay
                .checked_add(Duration::from_nanos(jitter))
                .unwrap_or(max_delay);
        }
        if !max_delay.is_zero() && delay > max_delay {
            delay = max_delay;
        }
        Some(delay)
    }
}

#[derive(Default)]
struct Inner {
    store: PeerStore,
    dialing: HashSet<NodeId>,
    /// Upgrades in flight: connected peer -> better peer being dialed.
    upgrading: HashMap<NodeId, NodeId>,
    connected: HashMap<NodeId, ConnectionDirection>,
    ready: HashSet<NodeId>,
    /// Explicit eviction requests, pending pickup by `evict_next`.
    evict: HashSet<NodeId>,
    /// Evictions handed out and not yet disconnected.
    evicting: HashSet<NodeId>,
    subscriptions: HashMap<u64, mpsc::Sender<PeerUpdate>>,
    next_subscription: u64,
}

/// Drives the peer lifecycle for the router.
pub struct PeerManager {
    self_id: NodeId,
    options: PeerManagerOptions,
    /// Built once at construction so `is_persistent` checks on hot paths
    /// never scan the configured list.
    persistent_peers_lookup: HashSet<NodeId>,
    dial_waker: Arc<Notify>,
    evict_waker: Arc<Notify>,
    inner: StdMutex<Inner>,
}

impl PeerManager {
    pub fn new(self_id: NodeId, options: PeerManagerOptions) -> Result<Self> {
        if options.persistent_peers.contains(&self_id) {
            return Err(Error::Duplicate(self_id));
        }
        let persistent_peers_lookup = options.persistent_peers.iter().copied().collect();

        Ok(Self {
            self_id,
            options,
            persistent_peers_lookup,
            dial_waker: Arc::new(Notify::new()),
            evict_waker: Arc::new(Notify::new()),
            inner: StdMutex::new(Inner::default()),
        })
    }

    pub fn is_persistent(&self, id: &NodeId) -> bool {
        self.persistent_peers_lookup.contains(id)
    }

    pub fn options(&self) -> &PeerManagerOptions {
        &self.options
    }

    /// Register a candidate address. Returns whether anything new was
    /// learned. Wakes the dial loop either way.
    pub fn add(&self, address: NodeAddress) -> Result<bool> {
        if address.node_id == self.self_id {
            return Err(Error::Duplicate(self.self_id));
        }

        let mut inner = self.lock();
        let mut peer = inner
            .store
            .get(&address.node_id)
            .unwrap_or_else(|| PeerInfo::new(address.node_id));
        self.configure_peer(&mut peer);
        let added = peer.add_address(address);
        inner.store.set(peer);
        drop(inner);

        self.dial_waker.notify_one();
        Ok(added)
    }

    /// Subscribe to peer status updates. Per-peer ordering of transitions
    /// is preserved.
    pub fn subscribe(&self) -> mpsc::Receiver<PeerUpdate> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut inner = self.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.subscriptions.insert(id, tx);
        rx
    }

    /// Report a peer as fully routed; broadcasts `Up` to subscribers.
    pub async fn ready(&self, done: &mut Shutdown, peer_id: NodeId, channels: BTreeSet<ChannelId>) {
        let subscribers = {
            let mut inner = self.lock();
            if !inner.connected.contains_key(&peer_id) {
                return;
            }
            inner.ready.insert(peer_id);
            self.live_subscribers(&mut inner)
        };
        let mut update = PeerUpdate::new(peer_id, PeerStatus::Up);
        update.channels = channels;
        broadcast(done, subscribers, update).await;
    }

    /// Block until there is a peer worth dialing, and claim it.
    pub async fn dial_next(&self, done: &mut Shutdown) -> Result<NodeAddress> {
        loop {
            if let Some(address) = self.try_dial_next() {
                return Ok(address);
            }
            tokio::select! {
                _ = self.dial_waker.notified() => {}
                _ = done.wait() => return Err(Error::Canceled),
            }
        }
    }

    /// One shot of the dial policy: pick the best-scored candidate that is
    /// neither connected nor dialing, has cleared its cooldown and retry
    /// windows, and fits the connection budget (possibly via an upgrade
    /// slot).
    pub fn try_dial_next(&self) -> Option<NodeAddress> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        if self.options.max_connected > 0
            && inner.connected.len() + inner.dialing.len()
                >= self.options.max_connected + self.options.max_connected_upgrade
        {
            return None;
        }

        if self.options.max_outgoing_connections > 0 {
            let outgoing = inner
                .connected
                .values()
                .filter(|dir| **dir == ConnectionDirection::Outgoing)
                .count();
            if outgoing >= self.options.max_outgoing_connections {
                return None;
            }
        }

        for peer_id in inner.store.ranked() {
            if inner.dialing.contains(&peer_id) || inner.connected.contains_key(&peer_id) {
                continue;
            }
            let peer = match inner.store.get(&peer_id) {
                Some(peer) => peer,
                None => continue,
            };
            if peer.inactive {
                continue;
            }
            if let Some(last) = peer.last_disconnected {
                if last.elapsed() < self.options.disconnect_cooldown_period {
                    continue;
                }
            }

            for info in peer.address_info.values() {
                let delay = match self
                    .options
                    .retry_delay(info.dial_failures, peer.persistent)
                {
                    Some(delay) => delay,
                    None => continue,
                };
                if let Some(last) = info.last_dial_failure {
                    if last.elapsed() < delay {
                        continue;
                    }
                }

                // An address may have moved between peers; skip it if its
                // current owner is busy.
                if let Some(owner) = inner.store.resolve(&info.address) {
                    if owner != peer_id
                        && (inner.connected.contains_key(&owner) || inner.dialing.contains(&owner))
                    {
                        continue;
                    }
                }

                if self.options.max_connected > 0
                    && inner.connected.len() >= self.options.max_connected
                {
                    let candidate =
                        find_upgrade_candidate(inner, peer_id, peer.score());
                    match candidate {
                        Some(from) => {
                            inner.upgrading.insert(from, peer_id);
                        }
                        None => return None,
                    }
                }

                inner.dialing.insert(peer_id);
                return Some(info.address.clone());
            }
        }
        None
    }

    /// Promote a dialed address to connected (outgoing), resetting its
    /// failure counter and finalizing any upgrade it was part of.
    pub fn dialed(&self, address: &NodeAddress) -> Result<()> {
        let mut inner = self.lock();
        let inner_ref = &mut *inner;

        inner_ref.dialing.remove(&address.node_id);

        let mut upgrade_from_peer = None;
        inner_ref.upgrading.retain(|from, to| {
            if *to == address.node_id {
                upgrade_from_peer = Some(*from);
                false
            } else {
                true
            }
        });

        if address.node_id == self.self_id {
            return Err(Error::Duplicate(self.self_id));
        }
        if inner_ref.connected.contains_key(&address.node_id) {
            return Err(Error::Duplicate(address.node_id));
        }
        if self.options.max_connected > 0
            && inner_ref.connected.len() >= self.options.max_connected
        {
            if upgrade_from_peer.is_none()
                || inner_ref.connected.len()
                    >= self.options.max_connected + self.options.max_connected_upgrade
            {
                return Err(Error::Capacity(
                    "already connected to maximum number of peers",
                ));
            }
        }

        let mut peer = inner_ref
            .store
            .get(&address.node_id)
            .ok_or_else(|| Error::protocol(format!("peer {} was removed while dialing", address.node_id)))?;
        let now = Instant::now();
        peer.inactive = false;
        peer.last_connected = Some(now);
        if let Some(info) = peer.address_info.get_mut(address) {
            info.dial_failures = 0;
            info.last_dial_success = Some(now);
        }
        let peer_score = peer.score();
        inner_ref.store.set(peer);

        if let Some(mut from) = upgrade_from_peer {
            if self.options.max_connected > 0
                && inner_ref.connected.len() >= self.options.max_connected
            {
                // The original upgrade target may have disconnected in the
                // meantime; re-check for the best current candidate.
                if let Some(better) =
                    find_upgrade_candidate(inner_ref, address.node_id, peer_score)
                {
                    from = better;
                }
                inner_ref.evict.insert(from);
                self.evict_waker.notify_one();
            }
        }
        inner_ref
            .connected
            .insert(address.node_id, ConnectionDirection::Outgoing);
        Ok(())
    }

    /// Record a dial failure and schedule the retry waker.
    pub fn dial_failed(&self, done: &Shutdown, address: &NodeAddress) {
        let mut inner = self.lock();
        inner.dialing.remove(&address.node_id);
        let failed_id = address.node_id;
        inner.upgrading.retain(|_, to| *to != failed_id);

        let peer = match inner.store.get(&address.node_id) {
            Some(peer) => peer,
            None => return,
        };
        if !peer.address_info.contains_key(address) {
            return;
        }

        let mut failures = 0;
        let persistent = peer.persistent;
        inner.store.update(address.node_id, |peer| {
            if let Some(info) = peer.address_info.get_mut(address) {
                info.last_dial_failure = Some(Instant::now());
                info.dial_failures += 1;
                failures = info.dial_failures;
            }
        });
        drop(inner);

        match self.options.retry_delay(failures, persistent) {
            Some(delay) if !delay.is_zero() => {
                let waker = self.dial_waker.clone();
                let mut done = done.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = time::sleep(delay) => waker.notify_one(),
                        _ = done.wait() => {}
                    }
                });
            }
            Some(_) => self.dial_waker.notify_one(),
            // Retries disabled; nothing will wake for this address.
            None => {}
        }
    }

    /// Admit an inbound peer, possibly claiming an upgrade slot by marking
    /// the worst connected peer for eviction.
    pub fn accepted(&self, peer_id: NodeId) -> Result<()> {
        let mut inner = self.lock();
        let inner_ref = &mut *inner;

        if peer_id == self.self_id {
            return Err(Error::Duplicate(self.self_id));
        }
        if inner_ref.connected.contains_key(&peer_id) {
            return Err(Error::Duplicate(peer_id));
        }
        if self.options.max_connected > 0
            && inner_ref.connected.len()
                >= self.options.max_connected + self.options.max_connected_upgrade
        {
            return Err(Error::Capacity(
                "already connected to maximum number of peers",
            ));
        }

        let mut peer = inner_ref
            .store
            .get(&peer_id)
            .unwrap_or_else(|| PeerInfo::new(peer_id));
        self.configure_peer(&mut peer);
        for info in peer.address_info.values_mut() {
            info.dial_failures = 0;
        }

        let mut upgrade_from_peer = None;
        if self.options.max_connected > 0 && inner_ref.connected.len() >= self.options.max_connected
        {
            upgrade_from_peer =
                find_upgrade_candidate(inner_ref, peer_id, peer.score());
            if upgrade_from_peer.is_none() {
                return Err(Error::Capacity(
                    "already connected to maximum number of peers",
                ));
            }
        }

        peer.inactive = false;
        peer.last_connected = Some(Instant::now());
        inner_ref.store.set(peer);

        inner_ref
            .connected
            .insert(peer_id, ConnectionDirection::Incoming);
        if let Some(from) = upgrade_from_peer {
            inner_ref.evict.insert(from);
        }
        self.evict_waker.notify_one();
        Ok(())
    }

    /// A reactor or connection declared this peer broken; mark it for
    /// eviction.
    pub fn errored(&self, peer_id: NodeId, err: &Error) {
        debug!(peer = %peer_id, %err, "peer errored");
        let mut inner = self.lock();
        if inner.connected.contains_key(&peer_id) {
            inner.evict.insert(peer_id);
        }
        drop(inner);
        self.evict_waker.notify_one();
    }

    /// Block until some peer should be evicted, and claim it.
    pub async fn evict_next(&self, done: &mut Shutdown) -> Result<NodeId> {
        loop {
            if let Some(peer_id) = self.try_evict_next() {
                return Ok(peer_id);
            }
            tokio::select! {
                _ = self.evict_waker.notified() => {}
                _ = done.wait() => return Err(Error::Canceled),
            }
        }
    }

    /// One shot of the eviction policy: explicit requests first, then the
    /// worst-ranked connected peer whenever the connected set overflows
    /// `max_connected`.
    pub fn try_evict_next(&self) -> Option<NodeId> {
        let mut inner = self.lock();
        let inner = &mut *inner;

        // Inspect explicit requests one at a time, leaving the rest queued
        // for the next call.
        while let Some(&peer_id) = inner.evict.iter().next() {
            inner.evict.remove(&peer_id);
            if inner.connected.contains_key(&peer_id) && !inner.evicting.contains(&peer_id) {
                inner.evicting.insert(peer_id);
                return Some(peer_id);
            }
        }

        if self.options.max_connected == 0
            || inner.connected.len().saturating_sub(inner.evicting.len())
                <= self.options.max_connected
        {
            return None;
        }

        let ranked = inner.store.ranked();
        for peer_id in ranked.into_iter().rev() {
            if inner.connected.contains_key(&peer_id) && !inner.evicting.contains(&peer_id) {
                inner.evicting.insert(peer_id);
                return Some(peer_id);
            }
        }
        None
    }

    /// Mark a peer as not worth dialing (e.g. incompatible network).
    pub fn inactivate(&self, peer_id: NodeId) {
        let mut inner = self.lock();
        if inner.store.contains(&peer_id) {
            inner.store.update(peer_id, |peer| peer.inactive = true);
        }
    }

    /// Drop every piece of connection state for a peer and start its
    /// cooldown clock. Broadcasts `Down` if the peer had been ready.
    pub async fn disconnected(&self, done: &mut Shutdown, peer_id: NodeId) {
        let (was_ready, known, subscribers) = {
            let mut inner = self.lock();
            let was_ready = inner.ready.remove(&peer_id);
            inner.connected.remove(&peer_id);
            inner.upgrading.remove(&peer_id);
            inner.evict.remove(&peer_id);
            inner.evicting.remove(&peer_id);

            let known = inner.store.contains(&peer_id);
            if known {
                inner
                    .store
                    .update(peer_id, |peer| peer.last_disconnected = Some(Instant::now()));
            }
            let subscribers = self.live_subscribers(&mut inner);
            (was_ready, known, subscribers)
        };

        if known && !self.options.disconnect_cooldown_period.is_zero() {
            let waker = self.dial_waker.clone();
            let cooldown = self.options.disconnect_cooldown_period;
            let mut done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = time::sleep(cooldown) => waker.notify_one(),
                    _ = done.wait() => {}
                }
            });
        }

        if was_ready {
            broadcast(done, subscribers, PeerUpdate::new(peer_id, PeerStatus::Down)).await;
        }

        self.dial_waker.notify_one();
    }

    /// Reactor-reported behavior: bump the mutable score up or down,
    /// saturating at the i16 bounds.
    pub fn process_peer_event(&self, update: &PeerUpdate) {
        let mut inner = self.lock();
        inner.store.update(update.node_id, |peer| match update.status {
            PeerStatus::Good => peer.mutable_score = peer.mutable_score.saturating_add(1),
            PeerStatus::Bad => peer.mutable_score = peer.mutable_score.saturating_sub(1),
            PeerStatus::Up | PeerStatus::Down => {}
        });
    }

    /// Whether every regular connection slot is in use.
    pub fn has_max_peer_capacity(&self) -> bool {
        if self.options.max_connected == 0 {
            return false;
        }
        let inner = self.lock();
        inner.connected.len() >= self.options.max_connected
    }

    pub fn is_connected(&self, peer_id: &NodeId) -> bool {
        self.lock().connected.contains_key(peer_id)
    }

    /// Snapshot of the connected set, for tests and introspection.
    pub fn connected_peers(&self) -> HashMap<NodeId, ConnectionDirection> {
        self.lock().connected.clone()
    }

    fn configure_peer(&self, peer: &mut PeerInfo) {
        peer.persistent = self.is_persistent(&peer.id);
        if let Some(score) = self.options.peer_scores.get(&peer.id) {
            peer.fixed_score = *score;
        }
    }

    fn live_subscribers(&self, inner: &mut Inner) -> Vec<mpsc::Sender<PeerUpdate>> {
        inner.subscriptions.retain(|_, tx| !tx.is_closed());
        inner.subscriptions.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("peer manager lock poisoned")
    }
}

/// The connected peer to displace for `id` (score `score`), if any: the
/// worst-ranked connected peer with a strictly lower score that is not
/// already being evicted or upgraded away.
fn find_upgrade_candidate(inner: &mut Inner, id: NodeId, score: PeerScore) -> Option<NodeId> {
    // Reuse an upgrade slot already claimed for this target.
    if let Some(from) = inner
        .upgrading
        .iter()
        .find_map(|(from, to)| if *to == id { Some(*from) } else { None })
    {
        return Some(from);
    }

    let ranked = inner.store.ranked();
    for candidate_id in ranked.into_iter().rev() {
        if candidate_id == id {
            continue;
        }
        let candidate_score = match inner.store.get(&candidate_id) {
            Some(candidate) => candidate.score(),
            None => continue,
        };
        // Ranked ascending from here on; no worse candidates remain.
        if candidate_score >= score {
            return None;
        }
        if !inner.connected.contains_key(&candidate_id) {
            continue;
        }
        if inner.evict.contains(&candidate_id) || inner.evicting.contains(&candidate_id) {
            continue;
        }
        if inner.upgrading.contains_key(&candidate_id) {
            continue;
        }
        return Some(candidate_id);
    }
    None
}

async fn broadcast(
    done: &mut Shutdown,
    subscribers: Vec<mpsc::Sender<PeerUpdate>>,
    update: PeerUpdate,
) {
    for tx in subscribers {
        // A send failure means the subscriber went away; it is pruned on
        // the next broadcast.
        tokio::select! {
            _ = done.wait() => return,
            _ = tx.send(update.clone()) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;

    fn id(byte: u8) -> NodeId {
        NodeId::new([byte; 20])
    }

    fn addr(byte: u8) -> NodeAddress {
        NodeAddress {
            protocol: "mconn".to_owned(),
            node_id: id(byte),
            hostname: "127.0.0.1".to_owned(),
            port: 26000 + u16::from(byte),
            path: String::new(),
        }
    }

    fn manager(options: PeerManagerOptions) -> PeerManager {
        PeerManager::new(id(0xff), options).unwrap()
    }

    #[test]
    fn rejects_self_connections() {
        let pm = manager(PeerManagerOptions::default());
        assert!(matches!(pm.accepted(id(0xff)), Err(Error::Duplicate(_))));
        assert!(matches!(pm.add(addr(0xff)), Err(Error::Duplicate(_))));
    }

    #[test]
    fn rejects_duplicate_connections() {
        let pm = manager(PeerManagerOptions::default());
        pm.accepted(id(1)).unwrap();
        assert!(matches!(pm.accepted(id(1)), Err(Error::Duplicate(_))));
    }

    #[test]
    fn capacity_bound_holds() {
        let options = PeerManagerOptions {
            max_connected: 2,
            max_connected_upgrade: 1,
            ..Default::default()
        };
        let pm = manager(options);

        pm.accepted(id(1)).unwrap();
        pm.accepted(id(2)).unwrap();

        // No better-scored peer: no upgrade slot to claim.
        assert!(matches!(pm.accepted(id(3)), Err(Error::Capacity(_))));
        assert!(pm.connected_peers().len() <= 3);
    }

    #[tokio::test]
    async fn dial_lifecycle_claims_and_releases() {
        let pm = manager(PeerManagerOptions::default());
        pm.add(addr(1)).unwrap();

        let address = pm.try_dial_next().expect("a candidate to dial");
        assert_eq!(address.node_id, id(1));
        // Claimed: not offered again while dialing.
        assert!(pm.try_dial_next().is_none());

        pm.dialed(&address).unwrap();
        assert!(pm.is_connected(&id(1)));
        assert_eq!(
            pm.connected_peers()[&id(1)],
            ConnectionDirection::Outgoing
        );
    }

    #[tokio::test]
    async fn dial_failures_back_off() {
        let options = PeerManagerOptions {
            min_retry_time: Duration::from_secs(60),
            retry_time_jitter: Duration::ZERO,
            ..Default::default()
        };
        let pm = manager(options);
        let (_sig, done) = shutdown::channel();
        pm.add(addr(1)).unwrap();

        let address = pm.try_dial_next().unwrap();
        pm.dial_failed(&done, &address);

        // The address is in its retry window now.
        assert!(pm.try_dial_next().is_none());
    }

    #[test]
    fn retry_delay_scales_and_saturates() {
        let options = PeerManagerOptions {
            min_retry_time: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(10),
            max_retry_time_persistent: Duration::from_secs(20),
            retry_time_jitter: Duration::ZERO,
            ..Default::default()
        };

        assert_eq!(options.retry_delay(0, false), Some(Duration::ZERO));
        assert_eq!(options.retry_delay(3, false), Some(Duration::from_secs(3)));
        assert_eq!(options.retry_delay(50, false), Some(Duration::from_secs(10)));
        assert_eq!(options.retry_delay(50, true), Some(Duration::from_secs(20)));
        // Overflow-sized failure counts clamp instead of panicking.
        assert_eq!(
            options.retry_delay(u32::MAX, false),
            Some(Duration::from_secs(10))
        );

        let disabled = PeerManagerOptions {
            min_retry_time: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(disabled.retry_delay(1, false), None);
    }

    #[tokio::test]
    async fn upgrade_evicts_lower_scored_peer() {
        let options = PeerManagerOptions {
            max_connected: 2,
            max_connected_upgrade: 1,
            persistent_peers: vec![id(3)],
            ..Default::default()
        };
        let pm = manager(options);
        let (_sig, mut done) = shutdown::channel();

        // Two zero-score peers fill the connected set.
        pm.accepted(id(1)).unwrap();
        pm.accepted(id(2)).unwrap();

        // A persistent (max-score) candidate appears.
        pm.add(addr(3)).unwrap();
        let address = pm.try_dial_next().expect("upgrade slot for peer 3");
        assert_eq!(address.node_id, id(3));

        pm.dialed(&address).unwrap();
        assert!(pm.is_connected(&id(3)));

        // Exactly one of the zero-score peers is handed to the evictor.
        let evicted = pm.evict_next(&mut done).await.unwrap();
        assert!(evicted == id(1) || evicted == id(2));
        assert!(pm.try_evict_next().is_none());

        pm.disconnected(&mut done, evicted).await;
        let connected = pm.connected_peers();
        assert_eq!(connected.len(), 2);
        assert!(connected.contains_key(&id(3)));
    }

    #[tokio::test]
    async fn errored_peer_is_evicted() {
        let pm = manager(PeerManagerOptions::default());
        pm.accepted(id(1)).unwrap();

        pm.errored(id(1), &Error::protocol("misbehaved"));
        assert_eq!(pm.try_evict_next(), Some(id(1)));

        // Eviction requests for unconnected peers are dropped.
        pm.errored(id(9), &Error::protocol("unknown"));
        assert_eq!(pm.try_evict_next(), None);
    }

    #[tokio::test]
    async fn ready_and_disconnected_broadcast_in_order() {
        let pm = manager(PeerManagerOptions::default());
        let (_sig, mut done) = shutdown::channel();
        let mut updates = pm.subscribe();

        pm.accepted(id(1)).unwrap();
        let channels: BTreeSet<ChannelId> = [0x20u8].iter().copied().collect();
        pm.ready(&mut done, id(1), channels.clone()).await;
        pm.disconnected(&mut done, id(1)).await;

        let up = updates.recv().await.unwrap();
        assert_eq!((up.node_id, up.status), (id(1), PeerStatus::Up));
        assert_eq!(up.channels, channels);

        let down = updates.recv().await.unwrap();
        assert_eq!((down.node_id, down.status), (id(1), PeerStatus::Down));
    }

    #[tokio::test]
    async fn cooldown_gates_redial() {
        let options = PeerManagerOptions {
            disconnect_cooldown_period: Duration::from_secs(60),
            ..Default::default()
        };
        let pm = manager(options);
        let (_sig, mut done) = shutdown::channel();

        pm.add(addr(1)).unwrap();
        let address = pm.try_dial_next().unwrap();
        pm.dialed(&address).unwrap();
        pm.disconnected(&mut done, id(1)).await;

        // Within the cooldown the peer is not a dial candidate.
        assert!(pm.try_dial_next().is_none());
    }

    #[test]
    fn score_events_saturate() {
        let pm = manager(PeerManagerOptions::default());
        pm.accepted(id(1)).unwrap();

        for _ in 0..3 {
            pm.process_peer_event(&PeerUpdate::new(id(1), PeerStatus::Good));
        }
        let mut inner = pm.lock();
        assert_eq!(inner.store.get(&id(1)).unwrap().mutable_score, 3);
        inner.store.update(id(1), |peer| {
            peer.mutable_score = PeerScore::MAX;
        });
        drop(inner);

        pm.process_peer_event(&PeerUpdate::new(id(1), PeerStatus::Good));
        assert_eq!(
            pm.lock().store.get(&id(1)).unwrap().mutable_score,
            PeerScore::MAX
        );
    }

    #[test]
    fn inactivated_peers_are_not_dialed() {
        let pm = manager(PeerManagerOptions::default());
        pm.add(addr(1)).unwrap();
        pm.inactivate(id(1));
        assert!(pm.try_dial_next().is_none());
    }

    #[test]
    fn outgoing_bound_holds() {
        let options = PeerManagerOptions {
            max_outgoing_connections: 1,
            ..Default::default()
        };
        let pm = manager(options);

        pm.add(addr(1)).unwrap();
        let address = pm.try_dial_next().unwrap();
        pm.dialed(&address).unwrap();

        pm.add(addr(2)).unwrap();
        assert!(pm.try_dial_next().is_none());
    }
}
