//! Operator-facing configuration for the P2P stack.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    mconn::MConnConfig,
    node::{NodeAddress, NodeId},
    peer_manager::PeerManagerOptions,
    peer_store::PeerScore,
    router::RouterOptions,
};

/// Everything an operator can tune, deserializable from the node's config
/// file. Durations use humantime strings ("100ms", "45s").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct P2pConfig {
    /// `host:port` to listen on; IPv6 must be bracketed.
    pub listen_endpoint: String,
    /// Address advertised to peers when it differs from the listen
    /// endpoint (e.g. behind NAT).
    pub external_endpoint: Option<String>,

    pub max_connected: usize,
    pub max_connected_upgrade: usize,
    pub max_outgoing_connections: usize,

    #[serde(with = "humantime_serde")]
    pub flush_throttle: Duration,
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub pong_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,

    pub send_rate: u64,
    pub recv_rate: u64,
    pub max_packet_msg_payload_size: usize,

    /// `fifo` or `priority`.
    pub queue_type: String,
    #[serde(with = "humantime_serde")]
    pub incoming_connection_window: Duration,
    pub max_incoming_connection_attempts: usize,

    #[serde(with = "humantime_serde")]
    pub min_retry_time: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_time: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_time_persistent: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_time_jitter: Duration,
    #[serde(with = "humantime_serde")]
    pub disconnect_cooldown_period: Duration,

    /// Addresses (`id@host:port`) dialed with maximum score and unlimited
    /// patience.
    pub persistent_peers: Vec<String>,
    /// Peers whose addresses are never gossiped.
    pub private_peers: Vec<NodeId>,
    /// Operator-assigned fixed scores.
    pub peer_scores: HashMap<NodeId, PeerScore>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        let mconn = MConnConfig::default();
        let manager = PeerManagerOptions::default();
        Self {
            listen_endpoint: "0.0.0.0:26656".to_owned(),
            external_endpoint: None,
            max_connected: manager.max_connected,
            max_connected_upgrade: manager.max_connected_upgrade,
            max_outgoing_connections: manager.max_outgoing_connections,
            flush_throttle: mconn.flush_throttle,
            ping_interval: mconn.ping_interval,
            pong_timeout: mconn.pong_timeout,
            handshake_timeout: Duration::from_secs(20),
            dial_timeout: Duration::from_secs(3),
            resolve_timeout: Duration::from_secs(3),
            send_rate: mconn.send_rate,
            recv_rate: mconn.recv_rate,
            max_packet_msg_payload_size: mconn.max_packet_msg_payload_size,
            queue_type: "fifo".to_owned(),
            incoming_connection_window: Duration::from_millis(100),
            max_incoming_connection_attempts: 100,
            min_retry_time: manager.min_retry_time,
            max_retry_time: manager.max_retry_time,
            max_retry_time_persistent: manager.max_retry_time_persistent,
            retry_time_jitter: manager.retry_time_jitter,
            disconnect_cooldown_period: manager.disconnect_cooldown_period,
            persistent_peers: Vec::new(),
            private_peers: Vec::new(),
            peer_scores: HashMap::new(),
        }
    }
}

impl P2pConfig {
    pub fn mconn_config(&self) -> MConnConfig {
        let defaults = MConnConfig::default();
        MConnConfig {
            flush_throttle: self.flush_throttle,
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            max_packet_msg_payload_size: self.max_packet_msg_payload_size,
            send_rate: self.send_rate,
            recv_rate: self.recv_rate,
            send_timeout: defaults.send_timeout,
        }
    }

    /// Parse the configured persistent peer addresses.
    pub fn persistent_peer_addresses(&self) -> Result<Vec<NodeAddress>> {
        self.persistent_peers
            .iter()
            .map(|s| s.parse::<NodeAddress>())
            .collect()
    }

    pub fn peer_manager_options(&self) -> Result<PeerManagerOptions> {
        let persistent_peers = self
            .persistent_peer_addresses()?
            .into_iter()
            .map(|address| address.node_id)
            .collect();
        let private_peers: HashSet<NodeId> = self.private_peers.iter().copied().collect();

        Ok(PeerManagerOptions {
            persistent_peers,
            max_connected: self.max_connected,
            max_connected_upgrade: self.max_connected_upgrade,
            max_outgoing_connections: self.max_outgoing_connections,
            min_retry_time: self.min_retry_time,
            max_retry_time: self.max_retry_time,
            max_retry_time_persistent: self.max_retry_time_persistent,
            retry_time_jitter: self.retry_time_jitter,
            disconnect_cooldown_period: self.disconnect_cooldown_period,
            peer_scores: self.peer_scores.clone(),
            private_peers,
            ..Default::default()
        })
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            queue_type: self.queue_type.clone(),
            incoming_connection_window: self.incoming_connection_window,
            max_incoming_connection_attempts: self.max_incoming_connection_attempts,
            resolve_timeout: self.resolve_timeout,
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
            num_concurrent_dials: None,
            filter_peer_by_ip: None,
            filter_peer_by_id: None,
        }
    }
}
