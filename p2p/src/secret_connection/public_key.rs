//! Long-term public keys proven during the handshake.

use std::{
    convert::TryInto,
    fmt::{self, Display},
};

use ed25519_dalek as ed25519;

use crate::node::NodeId;

/// Secret connection peer public key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublicKey {
    /// Ed25519 secret connection keys
    Ed25519(ed25519::VerifyingKey),
}

impl PublicKey {
    /// Create from raw Ed25519 public key bytes.
    pub fn from_raw_ed25519(bytes: &[u8]) -> Option<Self> {
        bytes
            .try_into()
            .ok()
            .and_then(|fixed: &[u8; 32]| ed25519::VerifyingKey::from_bytes(fixed).ok())
            .map(PublicKey::Ed25519)
    }

    /// Borrow the Ed25519 public key, if this is one.
    pub fn ed25519(&self) -> Option<&ed25519::VerifyingKey> {
        match self {
            PublicKey::Ed25519(key) => Some(key),
        }
    }

    /// The node id this key authenticates.
    pub fn node_id(&self) -> NodeId {
        match self {
            PublicKey::Ed25519(key) => NodeId::from_ed25519(key),
        }
    }
}

impl From<&ed25519::SigningKey> for PublicKey {
    fn from(sk: &ed25519::SigningKey) -> Self {
        PublicKey::Ed25519(sk.verifying_key())
    }
}

impl From<ed25519::VerifyingKey> for PublicKey {
    fn from(pk: ed25519::VerifyingKey) -> Self {
        PublicKey::Ed25519(pk)
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_id())
    }
}
