//! Two routers talking over localhost TCP: dial, handshake, channel
//! routing, and peer status updates.

use std::{sync::Arc, time::Duration};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tokio::time;

use stele_p2p::{
    channel::Envelope,
    mconn::{ChannelDescriptor, MConnConfig},
    node::{NodeAddress, NodeId, NodeInfo, ProtocolVersion},
    peer_manager::{PeerManager, PeerManagerOptions, PeerStatus},
    router::{Router, RouterOptions},
    shutdown,
    transport::MConnTransport,
};
use stele_proto::p2p::PacketMsg;

const CHANNEL_ID: u8 = 0x20;
const NETWORK: &str = "stele-test";

struct Node {
    id: NodeId,
    router: Arc<Router>,
    signal: stele_p2p::ShutdownSignal,
}

fn node_info(id: NodeId, moniker: &str) -> NodeInfo {
    NodeInfo {
        protocol_version: ProtocolVersion {
            p2p: 8,
            block: 11,
            app: 0,
        },
        node_id: id,
        listen_addr: "127.0.0.1:0".to_owned(),
        network: NETWORK.to_owned(),
        version: "0.1.0".to_owned(),
        channels: Vec::new(),
        moniker: moniker.to_owned(),
        other: Default::default(),
    }
}

async fn start_node(moniker: &str) -> (Node, stele_p2p::channel::Channel, u16) {
    let priv_key = SigningKey::generate(&mut OsRng);
    let id = NodeId::from_ed25519(&priv_key.verifying_key());

    let transport = Arc::new(MConnTransport::new(MConnConfig {
        flush_throttle: Duration::from_millis(10),
        ..Default::default()
    }));
    let peer_manager = Arc::new(
        PeerManager::new(
            id,
            PeerManagerOptions {
                min_retry_time: Duration::from_millis(100),
                disconnect_cooldown_period: Duration::from_millis(100),
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let router = Router::new(
        node_info(id, moniker),
        priv_key,
        peer_manager,
        transport.clone(),
        "127.0.0.1:0",
        RouterOptions {
            handshake_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(5),
            num_concurrent_dials: Some(2),
            ..Default::default()
        },
    )
    .unwrap();

    let (signal, done) = shutdown::channel();
    let channel = router
        .open_channel::<PacketMsg>(&done, ChannelDescriptor::new(CHANNEL_ID, "test", 1))
        .unwrap();
    router.start(&done).await.unwrap();

    let port = transport.local_addr().unwrap().port();
    (Node { id, router, signal }, channel, port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn routers_exchange_envelopes() {
    let (alpha, mut alpha_channel, _alpha_port) = start_node("alpha").await;
    let (beta, mut beta_channel, beta_port) = start_node("beta").await;

    let mut alpha_updates = alpha.router.peer_manager().subscribe();
    let mut beta_updates = beta.router.peer_manager().subscribe();

    // Teach alpha about beta; the dial loop takes it from here.
    let address: NodeAddress = format!("{}@127.0.0.1:{}", beta.id, beta_port)
        .parse()
        .unwrap();
    alpha.router.peer_manager().add(address).unwrap();

    let up = time::timeout(Duration::from_secs(10), alpha_updates.recv())
        .await
        .expect("alpha sees beta come up")
        .unwrap();
    assert_eq!((up.node_id, up.status), (beta.id, PeerStatus::Up));
    assert!(up.channels.contains(&CHANNEL_ID));

    let up = time::timeout(Duration::from_secs(10), beta_updates.recv())
        .await
        .expect("beta sees alpha come up")
        .unwrap();
    assert_eq!((up.node_id, up.status), (alpha.id, PeerStatus::Up));

    // The Up event precedes the peer queue becoming routable; give both
    // routers a beat before addressing envelopes at each other.
    time::sleep(Duration::from_millis(200)).await;

    // Unicast alpha -> beta.
    let sent = PacketMsg {
        channel_id: 7,
        eof: true,
        data: b"over the wire".to_vec(),
    };
    alpha_channel
        .tx
        .send(Envelope::to(beta.id, sent.clone()))
        .await
        .unwrap();

    let received = time::timeout(Duration::from_secs(10), beta_channel.rx.recv())
        .await
        .expect("beta receives within timeout")
        .expect("an envelope");
    assert_eq!(received.from, Some(alpha.id));
    assert_eq!(received.channel_id, CHANNEL_ID);
    assert_eq!(received.message_as::<PacketMsg>().unwrap(), &sent);

    // Broadcast beta -> everyone (which is just alpha).
    let announce = PacketMsg {
        channel_id: 9,
        eof: false,
        data: b"to all peers".to_vec(),
    };
    beta_channel
        .tx
        .send(Envelope::broadcast(announce.clone()))
        .await
        .unwrap();

    let received = time::timeout(Duration::from_secs(10), alpha_channel.rx.recv())
        .await
        .expect("alpha receives within timeout")
        .expect("an envelope");
    assert_eq!(received.from, Some(beta.id));
    assert_eq!(received.message_as::<PacketMsg>().unwrap(), &announce);

    // Tear beta down; alpha observes the disconnect.
    beta.signal.trigger();
    let down = time::timeout(Duration::from_secs(10), alpha_updates.recv())
        .await
        .expect("alpha sees beta go down")
        .unwrap();
    assert_eq!((down.node_id, down.status), (beta.id, PeerStatus::Down));

    alpha.signal.trigger();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incompatible_network_is_rejected() {
    let (alpha, _alpha_channel, _alpha_port) = start_node("alpha").await;

    // A node on a different network.
    let priv_key = SigningKey::generate(&mut OsRng);
    let id = NodeId::from_ed25519(&priv_key.verifying_key());
    let transport = Arc::new(MConnTransport::new(MConnConfig::default()));
    let peer_manager = Arc::new(PeerManager::new(id, PeerManagerOptions::default()).unwrap());
    let mut other_info = node_info(id, "stranger");
    other_info.network = "other-net".to_owned();
    let router = Router::new(
        other_info,
        priv_key,
        peer_manager,
        transport.clone(),
        "127.0.0.1:0",
        RouterOptions {
            num_concurrent_dials: Some(1),
            ..Default::default()
        },
    )
    .unwrap();
    let (signal, done) = shutdown::channel();
    let _channel = router
        .open_channel::<PacketMsg>(&done, ChannelDescriptor::new(CHANNEL_ID, "test", 1))
        .unwrap();
    router.start(&done).await.unwrap();
    let stranger_port = transport.local_addr().unwrap().port();

    let mut alpha_updates = alpha.router.peer_manager().subscribe();
    let address: NodeAddress = format!("{}@127.0.0.1:{}", id, stranger_port)
        .parse()
        .unwrap();
    alpha.router.peer_manager().add(address).unwrap();

    // The handshake must fail compatibility: no Up event arrives.
    let res = time::timeout(Duration::from_millis(1500), alpha_updates.recv()).await;
    assert!(res.is_err(), "incompatible peer must not come up");
    assert!(!alpha.router.peer_manager().is_connected(&id));

    signal.trigger();
    drop(alpha);
}
