//! The stele P2P stack.
//!
//! Layered bottom-up:
//!
//! - [`secret_connection`]: authenticated key exchange and AEAD frame
//!   encryption over a raw byte stream.
//! - [`mconn`]: logical channels multiplexed over one secret connection,
//!   with fair scheduling, fragmentation, and keepalive.
//! - [`transport`]: TCP listen/accept/dial, wrapping each stream into a
//!   handshaked multiplexed connection.
//! - [`peer_store`] / [`peer_manager`]: peer metadata, scoring, and the
//!   dial/accept/upgrade/evict lifecycle.
//! - [`router`]: typed reactor channels routed over per-peer connections.

pub mod channel;
pub mod config;
pub mod error;
pub mod framing;
pub mod mconn;
pub mod node;
pub mod peer_manager;
pub mod peer_store;
pub mod router;
pub mod secret_connection;
pub mod shutdown;
pub mod transport;

pub use channel::{Channel, ChannelMessage, Envelope, PeerError};
pub use config::P2pConfig;
pub use error::{Error, Result};
pub use mconn::{ChannelDescriptor, ChannelId, MConnConfig, MConnection};
pub use node::{NodeAddress, NodeId, NodeInfo};
pub use peer_manager::{PeerManager, PeerManagerOptions, PeerStatus, PeerUpdate};
pub use router::{Router, RouterOptions};
pub use secret_connection::SecretConnection;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use transport::{MConnConnection, MConnTransport};
