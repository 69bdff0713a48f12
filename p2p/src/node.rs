//! Node identity, addressing, and the metadata record exchanged on
//! handshake.

use std::{
    collections::BTreeSet,
    convert::TryInto,
    fmt::{self, Display},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle_encoding::hex;
use tokio::net::lookup_host;

use stele_proto as proto;

use crate::{
    error::{Error, Result},
    mconn::ChannelId,
};

/// Length of a node ID in bytes.
pub const ID_LENGTH: usize = 20;

/// Default wire protocol scheme for node addresses.
pub const DEFAULT_PROTOCOL: &str = "mconn";

/// A node identifier: the first 20 bytes of the SHA-256 of the node's
/// long-term Ed25519 public key, rendered as lowercased hex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId([u8; ID_LENGTH]);

impl NodeId {
    pub fn new(bytes: [u8; ID_LENGTH]) -> Self {
        NodeId(bytes)
    }

    /// Derive the id that a long-term Ed25519 key authenticates.
    pub fn from_ed25519(pk: &ed25519_dalek::VerifyingKey) -> Self {
        let digest = Sha256::digest(pk.as_bytes());
        let mut bytes = [0u8; ID_LENGTH];
        bytes.copy_from_slice(&digest[..ID_LENGTH]);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = hex::encode(&self.0[..]);
        // hex::encode output is always valid ASCII
        write!(f, "{}", String::from_utf8_lossy(&encoded))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.to_ascii_lowercase())
            .map_err(|_| Error::Protocol(format!("invalid node id: {}", s)))?;
        let fixed: [u8; ID_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Protocol(format!("node id must be {} bytes", ID_LENGTH)))?;
        Ok(NodeId(fixed))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A dialable peer address: `mconn://<node-id>@<host>:<port>[/path]`.
///
/// The hostname may be a DNS name; [`NodeAddress::resolve`] expands it to
/// concrete `ip:port` endpoints.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub protocol: String,
    pub node_id: NodeId,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

impl NodeAddress {
    /// Resolve the hostname into endpoint strings, in resolver order.
    pub async fn resolve(&self) -> Result<Vec<String>> {
        let addrs = lookup_host((self.hostname.as_str(), self.port))
            .await
            .map_err(|e| Error::Protocol(format!("failed to resolve {}: {}", self, e)))?;
        Ok(addrs.map(|addr| addr.to_string()).collect())
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |msg: &str| Error::Protocol(format!("invalid node address {:?}: {}", s, msg));

        let (protocol, rest) = match s.find("://") {
            Some(pos) => (&s[..pos], &s[pos + 3..]),
            None => (DEFAULT_PROTOCOL, s),
        };
        if protocol.is_empty() {
            return Err(bad("empty protocol"));
        }

        let at = rest.find('@').ok_or_else(|| bad("missing node id"))?;
        let node_id: NodeId = rest[..at].parse()?;
        let rest = &rest[at + 1..];

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        // IPv6 hosts must be bracketed so the port separator is unambiguous.
        let (hostname, port_str) = if let Some(stripped) = authority.strip_prefix('[') {
            let close = stripped.find(']').ok_or_else(|| bad("unterminated '['"))?;
            let after = &stripped[close + 1..];
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| bad("missing port"))?;
            (&stripped[..close], port)
        } else {
            let colon = authority.rfind(':').ok_or_else(|| bad("missing port"))?;
            (&authority[..colon], &authority[colon + 1..])
        };
        if hostname.is_empty() {
            return Err(bad("empty host"));
        }
        let port: u16 = port_str.parse().map_err(|_| bad("invalid port"))?;

        Ok(NodeAddress {
            protocol: protocol.to_owned(),
            node_id,
            hostname: hostname.to_owned(),
            port,
            path: path.to_owned(),
        })
    }
}

impl Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };
        write!(
            f,
            "{}://{}@{}:{}{}",
            self.protocol, self.node_id, host, self.port, self.path
        )
    }
}

/// Semantic version numbers of the wire protocols a node speaks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub p2p: u64,
    pub block: u64,
    pub app: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeInfoOther {
    pub tx_index: String,
    pub rpc_address: String,
}

/// Self-reported node metadata, swapped over the encrypted stream at the
/// end of the transport handshake.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub protocol_version: ProtocolVersion,
    pub node_id: NodeId,
    pub listen_addr: String,
    pub network: String,
    pub version: String,
    pub channels: Vec<ChannelId>,
    pub moniker: String,
    pub other: NodeInfoOther,
}

impl NodeInfo {
    /// Basic well-formedness: a moniker and no duplicate channel ids.
    pub fn validate(&self) -> Result<()> {
        if self.moniker.is_empty() {
            return Err(Error::handshake("node info has an empty moniker"));
        }
        let unique: BTreeSet<ChannelId> = self.channels.iter().copied().collect();
        if unique.len() != self.channels.len() {
            return Err(Error::handshake("node info advertises duplicate channels"));
        }
        Ok(())
    }

    /// Two nodes are compatible iff they share a network name and a block
    /// protocol version.
    pub fn compatible_with(&self, other: &NodeInfo) -> Result<()> {
        if self.network != other.network {
            return Err(Error::Handshake(format!(
                "peer is on network {:?}, expected {:?}",
                other.network, self.network
            )));
        }
        if self.protocol_version.block != other.protocol_version.block {
            return Err(Error::Handshake(format!(
                "peer is on block protocol {}, expected {}",
                other.protocol_version.block, self.protocol_version.block
            )));
        }
        Ok(())
    }

    /// Advertise a reactor channel. Idempotent.
    pub fn add_channel(&mut self, id: ChannelId) {
        if !self.channels.contains(&id) {
            self.channels.push(id);
        }
    }

    pub fn channel_set(&self) -> BTreeSet<ChannelId> {
        self.channels.iter().copied().collect()
    }

    pub fn to_proto(&self) -> proto::p2p::NodeInfo {
        proto::p2p::NodeInfo {
            protocol_version: Some(proto::p2p::ProtocolVersion {
                p2p: self.protocol_version.p2p,
                block: self.protocol_version.block,
                app: self.protocol_version.app,
            }),
            node_id: self.node_id.to_string(),
            listen_addr: self.listen_addr.clone(),
            network: self.network.clone(),
            version: self.version.clone(),
            channels: self.channels.clone(),
            moniker: self.moniker.clone(),
            other: Some(proto::p2p::NodeInfoOther {
                tx_index: self.other.tx_index.clone(),
                rpc_address: self.other.rpc_address.clone(),
            }),
        }
    }

    pub fn from_proto(msg: proto::p2p::NodeInfo) -> Result<Self> {
        let pv = msg.protocol_version.unwrap_or_default();
        let other = msg.other.unwrap_or_default();
        Ok(NodeInfo {
            protocol_version: ProtocolVersion {
                p2p: pv.p2p,
                block: pv.block,
                app: pv.app,
            },
            node_id: msg.node_id.parse()?,
            listen_addr: msg.listen_addr,
            network: msg.network,
            version: msg.version,
            channels: msg.channels,
            moniker: msg.moniker,
            other: NodeInfoOther {
                tx_index: other.tx_index,
                rpc_address: other.rpc_address,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_from_ed25519_pubkey() {
        let pubkey_bytes: [u8; 32] = [
            81, 123, 53, 167, 93, 12, 167, 173, 33, 235, 98, 62, 180, 216, 59, 122, 187, 168, 26,
            237, 62, 84, 115, 90, 98, 122, 124, 59, 111, 146, 64, 109,
        ];
        let pubkey = ed25519_dalek::VerifyingKey::from_bytes(&pubkey_bytes).unwrap();
        let id = NodeId::from_ed25519(&pubkey);
        assert_eq!(id.to_string(), "cbc837aced724b22dc0bff1821cdbdd96164d637");
    }

    #[test]
    fn node_id_parse_round_trip() {
        let id: NodeId = "cbc837aced724b22dc0bff1821cdbdd96164d637".parse().unwrap();
        assert_eq!(id.to_string().parse::<NodeId>().unwrap(), id);

        assert!("cbc8".parse::<NodeId>().is_err());
        assert!("zzc837aced724b22dc0bff1821cdbdd96164d637"
            .parse::<NodeId>()
            .is_err());
    }

    #[test]
    fn address_parsing() {
        let addr: NodeAddress = "mconn://cbc837aced724b22dc0bff1821cdbdd96164d637@10.0.0.1:26656"
            .parse()
            .unwrap();
        assert_eq!(addr.protocol, "mconn");
        assert_eq!(addr.hostname, "10.0.0.1");
        assert_eq!(addr.port, 26656);
        assert_eq!(addr.path, "");
        assert_eq!(
            addr.to_string(),
            "mconn://cbc837aced724b22dc0bff1821cdbdd96164d637@10.0.0.1:26656"
        );

        // scheme-less form defaults the protocol
        let addr: NodeAddress = "cbc837aced724b22dc0bff1821cdbdd96164d637@seed.example.com:26656/p"
            .parse()
            .unwrap();
        assert_eq!(addr.protocol, DEFAULT_PROTOCOL);
        assert_eq!(addr.hostname, "seed.example.com");
        assert_eq!(addr.path, "/p");

        // IPv6 must be bracketed
        let addr: NodeAddress = "cbc837aced724b22dc0bff1821cdbdd96164d637@[::1]:26656"
            .parse()
            .unwrap();
        assert_eq!(addr.hostname, "::1");
        assert_eq!(
            addr.to_string(),
            "mconn://cbc837aced724b22dc0bff1821cdbdd96164d637@[::1]:26656"
        );

        assert!("not-an-address".parse::<NodeAddress>().is_err());
        assert!("cbc837aced724b22dc0bff1821cdbdd96164d637@host".parse::<NodeAddress>().is_err());
    }

    #[tokio::test]
    async fn address_resolution() {
        let addr: NodeAddress = "cbc837aced724b22dc0bff1821cdbdd96164d637@127.0.0.1:26656"
            .parse()
            .unwrap();
        let endpoints = addr.resolve().await.unwrap();
        assert_eq!(endpoints, vec!["127.0.0.1:26656".to_string()]);
    }

    fn node_info(network: &str, block: u64) -> NodeInfo {
        NodeInfo {
            protocol_version: ProtocolVersion {
                p2p: 8,
                block,
                app: 1,
            },
            node_id: "cbc837aced724b22dc0bff1821cdbdd96164d637".parse().unwrap(),
            listen_addr: "tcp://0.0.0.0:26656".to_owned(),
            network: network.to_owned(),
            version: "0.1.0".to_owned(),
            channels: vec![0x20, 0x21],
            moniker: "test-node".to_owned(),
            other: NodeInfoOther::default(),
        }
    }

    #[test]
    fn compatibility_requires_network_and_block_version() {
        let a = node_info("stele-test", 11);
        assert!(a.compatible_with(&node_info("stele-test", 11)).is_ok());
        assert!(a.compatible_with(&node_info("other-net", 11)).is_err());
        assert!(a.compatible_with(&node_info("stele-test", 12)).is_err());
    }

    #[test]
    fn validation_rejects_duplicate_channels() {
        let mut info = node_info("stele-test", 11);
        assert!(info.validate().is_ok());

        info.channels = vec![0x20, 0x20];
        assert!(info.validate().is_err());

        // add_channel is idempotent and never introduces duplicates
        let mut info = node_info("stele-test", 11);
        info.add_channel(0x20);
        info.add_channel(0x40);
        assert_eq!(info.channels, vec![0x20, 0x21, 0x40]);
    }

    #[test]
    fn proto_round_trip() {
        let info = node_info("stele-test", 11);
        let got = NodeInfo::from_proto(info.to_proto()).unwrap();
        assert_eq!(got, info);
    }
}
