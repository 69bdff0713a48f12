//! Router: owns the transport and peer manager, opens reactor channels,
//! and routes envelopes between reactors and peers.
//!
//! `start` launches three long-lived loops: `dial_peers` (dial policy into
//! a bounded worker pool), `accept_peers` (inbound connections), and
//! `evict_peers` (close queues of peers the manager wants gone). Each
//! routed peer runs a receive/send task pair joined by a two-slot error
//! channel; the first error tears the connection down.

use std::{
    any::TypeId,
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use ed25519_dalek as ed25519;
use prost::Message;
use tokio::{sync::mpsc, time};
use tracing::{debug, error, info};

use crate::{
    channel::{fifo_queue, Channel, ChannelMessage, Envelope, FifoQueue, FifoQueueReceiver, PeerError},
    error::{Error, Result},
    mconn::{ChannelDescriptor, ChannelId},
    node::{NodeAddress, NodeId, NodeInfo},
    peer_manager::{PeerManager, PeerStatus, PeerUpdate},
    shutdown::Shutdown,
    transport::{MConnConnection, MConnTransport},
};

/// Buffer size of per-peer outbound queues.
const QUEUE_BUFFER_DEFAULT: usize = 32;

/// Per-connection filter callbacks; return an error to reject.
pub type IpFilterFn = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;
pub type IdFilterFn = Arc<dyn Fn(&NodeId) -> Result<()> + Send + Sync>;

/// Router tunables.
#[derive(Clone, Default)]
pub struct RouterOptions {
    /// Queue discipline for peer and channel queues; `fifo` or `priority`.
    /// Empty selects `fifo`.
    pub queue_type: String,
    /// Sliding window for counting incoming connection attempts per IP.
    pub incoming_connection_window: Duration,
    pub max_incoming_connection_attempts: usize,
    /// Zero disables the corresponding timeout.
    pub resolve_timeout: Duration,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Dial worker pool size; defaults to `num_cpus * 32`.
    pub num_concurrent_dials: Option<usize>,
    pub filter_peer_by_ip: Option<IpFilterFn>,
    pub filter_peer_by_id: Option<IdFilterFn>,
}

impl RouterOptions {
    /// Normalize and check the options.
    pub fn validate(&mut self) -> Result<()> {
        match self.queue_type.as_str() {
            "" => self.queue_type = "fifo".to_owned(),
            "fifo" | "priority" => {}
            other => {
                return Err(Error::Protocol(format!(
                    "queue type {:?} is not supported",
                    other
                )))
            }
        }
        if self.incoming_connection_window.is_zero() {
            self.incoming_connection_window = Duration::from_millis(100);
        }
        if self.max_incoming_connection_attempts == 0 {
            self.max_incoming_connection_attempts = 100;
        }
        Ok(())
    }
}

/// Per-channel routing state: the inbound queue plus the decoder that turns
/// wire bytes back into the channel's message type.
struct ChannelCodec {
    type_id: TypeId,
    type_name: &'static str,
    decode: Arc<dyn Fn(&[u8]) -> Result<Arc<dyn ChannelMessage>> + Send + Sync>,
}

#[derive(Default)]
struct PeerMaps {
    queues: HashMap<NodeId, Arc<FifoQueue<Envelope>>>,
    channels: HashMap<NodeId, BTreeSet<ChannelId>>,
}

#[derive(Default)]
struct ChannelMaps {
    queues: HashMap<ChannelId, Arc<FifoQueue<Envelope>>>,
    codecs: HashMap<ChannelId, Arc<ChannelCodec>>,
}

/// Multiplexes typed reactor channels over per-peer connections.
pub struct Router {
    node_info: StdMutex<NodeInfo>,
    priv_key: ed25519::SigningKey,
    peer_manager: Arc<PeerManager>,
    transport: Arc<MConnTransport>,
    endpoint: String,
    options: RouterOptions,

    // peer_mtx: guards the per-peer queue and channel maps; held only
    // around lookups and inserts, never across I/O.
    peers: StdMutex<PeerMaps>,
    // channel_mtx: same discipline for the per-channel registries.
    channels: StdMutex<ChannelMaps>,
    incoming_attempts: StdMutex<HashMap<IpAddr, Vec<Instant>>>,
}

impl Router {
    pub fn new(
        node_info: NodeInfo,
        priv_key: ed25519::SigningKey,
        peer_manager: Arc<PeerManager>,
        transport: Arc<MConnTransport>,
        endpoint: impl Into<String>,
        mut options: RouterOptions,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        Ok(Arc::new(Self {
            node_info: StdMutex::new(node_info),
            priv_key,
            peer_manager,
            transport,
            endpoint: endpoint.into(),
            options,
            peers: StdMutex::new(PeerMaps::default()),
            channels: StdMutex::new(ChannelMaps::default()),
            incoming_attempts: StdMutex::new(HashMap::new()),
        }))
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn node_info(&self) -> NodeInfo {
        self.node_info.lock().expect("node info lock poisoned").clone()
    }

    /// Bind the transport and launch the dial, accept, and evict loops.
    pub async fn start(self: &Arc<Self>, done: &Shutdown) -> Result<()> {
        self.transport.listen(&self.endpoint).await?;

        tokio::spawn(self.clone().dial_peers(done.clone()));
        tokio::spawn(self.clone().evict_peers(done.clone()));
        tokio::spawn(self.clone().accept_peers(done.clone()));
        Ok(())
    }

    /// Open a reactor channel carrying messages of type `M`.
    ///
    /// The channel id is advertised in NodeInfo from now on; envelopes with
    /// a payload other than `M` are rejected at routing time.
    pub fn open_channel<M>(
        self: &Arc<Self>,
        done: &Shutdown,
        ch_desc: ChannelDescriptor,
    ) -> Result<Channel>
    where
        M: Message + Default + 'static,
    {
        let id = ch_desc.id;
        let (queue, queue_rx) = fifo_queue(ch_desc.recv_buffer_capacity);
        let (out_tx, out_rx) = mpsc::channel(ch_desc.recv_buffer_capacity.max(1));
        let (err_tx, err_rx) = mpsc::channel(ch_desc.recv_buffer_capacity.max(1));

        let codec = Arc::new(ChannelCodec {
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            decode: Arc::new(|bytes: &[u8]| {
                M::decode(bytes)
                    .map(|msg| Arc::new(msg) as Arc<dyn ChannelMessage>)
                    .map_err(Error::from)
            }),
        });

        {
            let mut channels = self.lock_channels();
            if channels.queues.contains_key(&id) {
                return Err(Error::Protocol(format!("channel {} already exists", id)));
            }
            channels.queues.insert(id, queue);
            channels.codecs.insert(id, codec.clone());
        }

        self.node_info
            .lock()
            .expect("node info lock poisoned")
            .add_channel(id);
        self.transport.add_channel_descriptors(vec![ch_desc.clone()]);

        let router = self.clone();
        let done = done.clone();
        tokio::spawn(async move {
            router
                .clone()
                .route_channel(done, id, out_rx, err_rx, codec)
                .await;
            let mut channels = router.lock_channels();
            if let Some(queue) = channels.queues.remove(&id) {
                queue.close();
            }
            channels.codecs.remove(&id);
        });

        Ok(Channel {
            id,
            rx: queue_rx,
            tx: out_tx,
            err_tx,
            name: ch_desc.name,
        })
    }

    /// Route one channel's outbound envelopes to peer queues and its error
    /// reports to the peer manager.
    async fn route_channel(
        self: Arc<Self>,
        mut done: Shutdown,
        ch_id: ChannelId,
        mut out_rx: mpsc::Receiver<Envelope>,
        mut err_rx: mpsc::Receiver<PeerError>,
        codec: Arc<ChannelCodec>,
    ) {
        enum RouteEvent {
            Outbound(Option<Envelope>),
            PeerError(Option<PeerError>),
            Done,
        }

        loop {
            let event = tokio::select! {
                maybe = out_rx.recv() => RouteEvent::Outbound(maybe),
                maybe = err_rx.recv() => RouteEvent::PeerError(maybe),
                _ = done.wait() => RouteEvent::Done,
            };

            match event {
                RouteEvent::Outbound(Some(mut envelope)) => {
                    envelope.channel_id = ch_id;

                    if envelope.message.as_any().type_id() != codec.type_id {
                        error!(
                            channel = ch_id,
                            expected = codec.type_name,
                            got = envelope.message.type_name(),
                            "refusing to route message of wrong type",
                        );
                        continue;
                    }

                    let queues: Vec<Arc<FifoQueue<Envelope>>> = if envelope.broadcast {
                        let peers = self.lock_peers();
                        peers
                            .queues
                            .iter()
                            .filter(|(peer_id, _)| {
                                peers
                                    .channels
                                    .get(peer_id)
                                    .map_or(false, |set| set.contains(&ch_id))
                            })
                            .map(|(_, queue)| queue.clone())
                            .collect()
                    } else {
                        let to = match envelope.to {
                            Some(to) => to,
                            None => {
                                error!(channel = ch_id, "dropping unaddressed envelope");
                                continue;
                            }
                        };
                        let peers = self.lock_peers();
                        match peers.queues.get(&to) {
                            None => {
                                debug!(peer = %to, channel = ch_id, "dropping message for unconnected peer");
                                continue;
                            }
                            Some(queue) => {
                                // The reactor may race a peer's channel set;
                                // silently drop instead of erroring.
                                if !peers
                                    .channels
                                    .get(&to)
                                    .map_or(false, |set| set.contains(&ch_id))
                                {
                                    continue;
                                }
                                vec![queue.clone()]
                            }
                        }
                    };

                    for queue in queues {
                        match queue.push(envelope.clone(), &mut done).await {
                            Ok(true) => {}
                            Ok(false) => {
                                debug!(channel = ch_id, "dropping message for disconnected peer")
                            }
                            Err(_) => return,
                        }
                    }
                }
                RouteEvent::PeerError(Some(peer_error)) => {
                    let at_capacity = self.peer_manager.has_max_peer_capacity();
                    error!(
                        peer = %peer_error.node_id,
                        err = %peer_error.err,
                        disconnecting = peer_error.fatal || at_capacity,
                        "peer error",
                    );
                    if peer_error.fatal || at_capacity {
                        self.peer_manager.errored(peer_error.node_id, &peer_error.err);
                    } else {
                        self.peer_manager.process_peer_event(&PeerUpdate::new(
                            peer_error.node_id,
                            PeerStatus::Bad,
                        ));
                    }
                }
                RouteEvent::Outbound(None) | RouteEvent::PeerError(None) | RouteEvent::Done => {
                    return
                }
            }
        }
    }

    /// Maintain outbound connections by dialing what the peer manager picks.
    async fn dial_peers(self: Arc<Self>, mut done: Shutdown) {
        debug!("starting dial routine");
        let (addr_tx, addr_rx) = mpsc::channel::<NodeAddress>(1);
        let addr_rx = Arc::new(tokio::sync::Mutex::new(addr_rx));

        let mut workers = Vec::new();
        for _ in 0..self.num_concurrent_dials() {
            let router = self.clone();
            let addr_rx = addr_rx.clone();
            let done = done.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let address = { addr_rx.lock().await.recv().await };
                    match address {
                        Some(address) => router.clone().connect_peer(done.clone(), address).await,
                        None => return,
                    }
                }
            }));
        }

        loop {
            let address = match self.peer_manager.dial_next(&mut done).await {
                Ok(address) => address,
                Err(_) => break,
            };
            tokio::select! {
                res = addr_tx.send(address) => {
                    if res.is_err() {
                        break;
                    }
                }
                _ = done.wait() => break,
            }
        }

        drop(addr_tx);
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Dial, handshake, admit, and route one peer address.
    async fn connect_peer(self: Arc<Self>, mut done: Shutdown, address: NodeAddress) {
        let conn = match self.dial_peer(&mut done, &address).await {
            Ok(conn) => conn,
            Err(err) => {
                if err.is_canceled() {
                    return;
                }
                debug!(peer = %address.node_id, %err, "failed to dial peer");
                self.peer_manager.dial_failed(&done, &address);
                return;
            }
        };

        let peer_info = match self
            .handshake_peer(&mut done, &conn, Some(address.node_id))
            .await
        {
            Ok(peer_info) => peer_info,
            Err(err) => {
                if !err.is_canceled() {
                    error!(peer = %address.node_id, %err, "failed to handshake with peer");
                    self.peer_manager.dial_failed(&done, &address);
                }
                conn.close();
                return;
            }
        };

        // Admit under the peer map lock so queue creation cannot race the
        // manager's accounting.
        let admitted = {
            let _guard = self.lock_peers();
            self.peer_manager.dialed(&address)
        };
        if let Err(err) = admitted {
            error!(op = "outgoing/dialing", peer = %address.node_id, %err, "failed to dial peer");
            conn.close();
            return;
        }

        let channels = peer_info.channel_set();
        tokio::spawn(
            self.clone()
                .route_peer(done, address.node_id, Arc::new(conn), channels),
        );
    }

    /// Resolve an address and dial its endpoints in order.
    async fn dial_peer(
        &self,
        done: &mut Shutdown,
        address: &NodeAddress,
    ) -> Result<MConnConnection> {
        debug!(peer = %address.node_id, "resolving peer address");

        let resolve = address.resolve();
        let endpoints = if self.options.resolve_timeout.is_zero() {
            resolve.await?
        } else {
            time::timeout(self.options.resolve_timeout, resolve)
                .await
                .map_err(|_| Error::Timeout("address resolution timed out"))??
        };
        if endpoints.is_empty() {
            return Err(Error::Handshake(format!(
                "address {} did not resolve to any endpoints",
                address
            )));
        }

        for endpoint in &endpoints {
            if done.is_triggered() {
                return Err(Error::Canceled);
            }
            let dial = self.transport.dial(endpoint);
            let res = if self.options.dial_timeout.is_zero() {
                dial.await
            } else {
                time::timeout(self.options.dial_timeout, dial)
                    .await
                    .map_err(|_| Error::Timeout("dial timed out"))
                    .and_then(|res| res)
            };
            match res {
                Ok(conn) => {
                    debug!(peer = %address.node_id, endpoint = endpoint.as_str(), "dialed peer");
                    return Ok(conn);
                }
                Err(err) => {
                    debug!(
                        peer = %address.node_id,
                        endpoint = endpoint.as_str(),
                        %err,
                        "failed to dial endpoint",
                    );
                }
            }
        }
        Err(Error::Handshake(format!(
            "all endpoints of {} failed",
            address
        )))
    }

    fn num_concurrent_dials(&self) -> usize {
        self.options
            .num_concurrent_dials
            .unwrap_or_else(|| num_cpus::get() * 32)
    }

    /// Close the outbound queues of peers the manager evicts; the peer's
    /// route task observes the closed queue and tears the connection down.
    async fn evict_peers(self: Arc<Self>, mut done: Shutdown) {
        loop {
            let peer_id = match self.peer_manager.evict_next(&mut done).await {
                Ok(peer_id) => peer_id,
                Err(_) => return,
            };
            info!(peer = %peer_id, "evicting peer");

            let queue = {
                let peers = self.lock_peers();
                peers.queues.get(&peer_id).cloned()
            };
            if let Some(queue) = queue {
                queue.close();
            }
        }
    }

    /// Accept inbound connections and route each through a handshake.
    async fn accept_peers(self: Arc<Self>, mut done: Shutdown) {
        debug!(transport = "mconn", "starting accept routine");
        loop {
            let conn = match self.transport.accept(&mut done).await {
                Ok(conn) => conn,
                Err(err) if err.is_closed() => {
                    debug!(transport = "mconn", %err, "stopping accept routine");
                    return;
                }
                Err(err) => {
                    error!(transport = "mconn", %err, "failed to accept connection");
                    continue;
                }
            };

            tokio::spawn(self.clone().open_connection(done.clone(), conn));
        }
    }

    async fn open_connection(self: Arc<Self>, mut done: Shutdown, conn: MConnConnection) {
        let remote = conn.remote_endpoint().to_owned();

        // IP-level filtering runs before the handshake spends any crypto.
        if let Err(err) = self.filter_peers_ip(&remote) {
            debug!(ip = remote.as_str(), %err, "peer filtered by IP");
            conn.close();
            return;
        }

        let peer_info = match self.handshake_peer(&mut done, &conn, None).await {
            Ok(peer_info) => peer_info,
            Err(err) => {
                if !err.is_canceled() {
                    error!(endpoint = remote.as_str(), %err, "peer handshake failed");
                }
                conn.close();
                return;
            }
        };

        if let Err(err) = self.filter_peers_id(&peer_info.node_id) {
            debug!(node = %peer_info.node_id, %err, "peer filtered by node ID");
            conn.close();
            return;
        }

        let accepted = {
            let _guard = self.lock_peers();
            self.peer_manager.accepted(peer_info.node_id)
        };
        if let Err(err) = accepted {
            error!(op = "incoming/accepted", peer = %peer_info.node_id, %err, "failed to accept connection");
            conn.close();
            return;
        }

        let channels = peer_info.channel_set();
        self.clone()
            .route_peer(done, peer_info.node_id, Arc::new(conn), channels)
            .await;
    }

    fn filter_peers_ip(&self, endpoint: &str) -> Result<()> {
        self.track_incoming_attempt(endpoint)?;
        match &self.options.filter_peer_by_ip {
            Some(filter) => filter(endpoint),
            None => Ok(()),
        }
    }

    /// Sliding-window limit on connection attempts per source IP.
    fn track_incoming_attempt(&self, endpoint: &str) -> Result<()> {
        let ip: IpAddr = match endpoint
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
            .and_then(|host| host.parse().ok())
        {
            Some(ip) => ip,
            None => return Err(Error::Protocol(format!("malformed endpoint {:?}", endpoint))),
        };

        let window = self.options.incoming_connection_window;
        let mut attempts = self
            .incoming_attempts
            .lock()
            .expect("incoming attempt lock poisoned");
        let entry = attempts.entry(ip).or_default();
        let now = Instant::now();
        entry.retain(|at| now.duration_since(*at) < window);
        if entry.len() >= self.options.max_incoming_connection_attempts {
            return Err(Error::Capacity("too many incoming connection attempts"));
        }
        entry.push(now);
        Ok(())
    }

    fn filter_peers_id(&self, id: &NodeId) -> Result<()> {
        match &self.options.filter_peer_by_id {
            Some(filter) => filter(id),
            None => Ok(()),
        }
    }

    /// Run the transport handshake and vet the result: NodeInfo validity,
    /// key/id consistency, the dialed identity, and compatibility.
    async fn handshake_peer(
        &self,
        done: &mut Shutdown,
        conn: &MConnConnection,
        expect_id: Option<NodeId>,
    ) -> Result<NodeInfo> {
        let local_info = self.node_info();

        let handshake = conn.handshake(done, &local_info, &self.priv_key);
        let (peer_info, peer_key) = if self.options.handshake_timeout.is_zero() {
            handshake.await?
        } else {
            time::timeout(self.options.handshake_timeout, handshake)
                .await
                .map_err(|_| Error::Timeout("handshake timed out"))??
        };

        peer_info
            .validate()
            .map_err(|err| Error::Handshake(format!("invalid handshake NodeInfo: {}", err)))?;

        let derived_id = peer_key.node_id();
        if derived_id != peer_info.node_id {
            return Err(Error::Handshake(format!(
                "peer's public key did not match its node ID {} (expected {})",
                peer_info.node_id, derived_id
            )));
        }
        if let Some(expect) = expect_id {
            if expect != peer_info.node_id {
                return Err(Error::Handshake(format!(
                    "expected to connect with peer {}, got {}",
                    expect, peer_info.node_id
                )));
            }
        }

        if let Err(err) = local_info.compatible_with(&peer_info) {
            self.peer_manager.inactivate(peer_info.node_id);
            return Err(err);
        }
        Ok(peer_info)
    }

    /// Route messages to and from one connected peer until either side
    /// fails or the peer is evicted, then disconnect it.
    async fn route_peer(
        self: Arc<Self>,
        mut done: Shutdown,
        peer_id: NodeId,
        conn: Arc<MConnConnection>,
        channels: BTreeSet<ChannelId>,
    ) {
        self.peer_manager
            .ready(&mut done, peer_id, channels.clone())
            .await;

        let (send_queue, send_queue_rx) = {
            let mut peers = self.lock_peers();
            let (queue, rx) = fifo_queue(QUEUE_BUFFER_DEFAULT);
            peers.queues.insert(peer_id, queue.clone());
            peers.channels.insert(peer_id, channels);
            (queue, rx)
        };

        info!(peer = %peer_id, endpoint = conn.remote_endpoint(), "peer connected");

        let (err_tx, mut err_rx) = mpsc::channel::<Option<Error>>(2);
        {
            let router = self.clone();
            let conn = conn.clone();
            let err_tx = err_tx.clone();
            let mut done = done.clone();
            tokio::spawn(async move {
                let res = router.receive_peer(&mut done, peer_id, &conn).await;
                let _ = err_tx.send(res.err()).await;
            });
        }
        {
            let conn = conn.clone();
            let mut done = done.clone();
            tokio::spawn(async move {
                let res = send_peer(&mut done, &conn, send_queue_rx).await;
                let _ = err_tx.send(res.err()).await;
            });
        }

        // First completion wins: close the connection and queue so the
        // sibling task unwinds too.
        let first = err_rx.recv().await.flatten();
        conn.close();
        send_queue.close();
        let second = err_rx.recv().await.flatten();

        match first.or(second) {
            Some(err) if !err.is_closed() => {
                error!(peer = %peer_id, endpoint = conn.remote_endpoint(), %err, "peer failure")
            }
            _ => info!(peer = %peer_id, endpoint = conn.remote_endpoint(), "peer disconnected"),
        }

        {
            let mut peers = self.lock_peers();
            peers.queues.remove(&peer_id);
            peers.channels.remove(&peer_id);
        }
        self.peer_manager.disconnected(&mut done, peer_id).await;
    }

    /// Receive inbound messages from a peer, decode them, and pass them to
    /// the owning channel's queue.
    async fn receive_peer(
        &self,
        done: &mut Shutdown,
        peer_id: NodeId,
        conn: &MConnConnection,
    ) -> Result<()> {
        loop {
            let (ch_id, bytes) = conn.receive_message(done).await?;

            let entry = {
                let channels = self.lock_channels();
                channels
                    .queues
                    .get(&ch_id)
                    .cloned()
                    .zip(channels.codecs.get(&ch_id).cloned())
            };
            let (queue, codec) = match entry {
                Some(entry) => entry,
                None => {
                    debug!(peer = %peer_id, channel = ch_id, "dropping message for unknown channel");
                    continue;
                }
            };

            let message = match (codec.decode)(&bytes) {
                Ok(message) => message,
                Err(err) => {
                    error!(peer = %peer_id, %err, "message decoding failed, dropping message");
                    continue;
                }
            };

            let envelope = Envelope::inbound(peer_id, ch_id, message);
            match queue.push(envelope, done).await {
                Ok(true) => debug!(peer = %peer_id, channel = ch_id, "received message"),
                Ok(false) => {
                    debug!(peer = %peer_id, channel = ch_id, "channel closed, dropping message")
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, PeerMaps> {
        self.peers.lock().expect("peer map lock poisoned")
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, ChannelMaps> {
        self.channels.lock().expect("channel map lock poisoned")
    }
}

/// Serialize and ship queued envelopes to the peer. Returns cleanly when
/// the queue closes.
async fn send_peer(
    done: &mut Shutdown,
    conn: &MConnConnection,
    mut queue: FifoQueueReceiver<Envelope>,
) -> Result<()> {
    loop {
        let envelope = match queue.recv().await {
            Some(envelope) => envelope,
            None => return Ok(()),
        };
        let bytes = envelope.message.encode_bytes();
        conn.send_message(done, envelope.channel_id, bytes).await?;
        debug!(
            channel = envelope.channel_id,
            message = envelope.message.type_name(),
            "sent message",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_validation() {
        let mut options = RouterOptions::default();
        options.validate().unwrap();
        assert_eq!(options.queue_type, "fifo");
        assert_eq!(options.incoming_connection_window, Duration::from_millis(100));
        assert_eq!(options.max_incoming_connection_attempts, 100);

        let mut options = RouterOptions {
            queue_type: "priority".to_owned(),
            ..Default::default()
        };
        options.validate().unwrap();

        let mut options = RouterOptions {
            queue_type: "lifo".to_owned(),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
