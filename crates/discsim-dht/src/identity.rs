//! Simulated node identities
//!
//! Peers get a random 32-byte key and derive their [`NodeId`] from it with
//! BLAKE2s-256. No signing happens in the simulator; the key only anchors the
//! identity so that populations are reproducible from a seed.

use crate::node_id::{NodeId, NODE_ID_SIZE};
use blake2::{Blake2s256, Digest};
use rand::Rng;
use std::fmt;

/// Size of a node key in bytes
pub const NODE_KEY_SIZE: usize = 32;

/// Secret identity key of a simulated peer
#[derive(Clone, PartialEq, Eq)]
pub struct NodeKey([u8; NODE_KEY_SIZE]);

impl NodeKey {
    /// Draw a fresh key from the injected generator
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NODE_KEY_SIZE];
        rng.fill(&mut bytes[..]);
        NodeKey(bytes)
    }

    /// Wrap existing key material
    pub fn from_bytes(bytes: [u8; NODE_KEY_SIZE]) -> Self {
        NodeKey(bytes)
    }

    /// Derive the node ID: BLAKE2s-256(key)
    pub fn node_id(&self) -> NodeId {
        NodeId::from_bytes(hash_to_id(&self.0))
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material
        write!(f, "NodeKey({})", self.node_id())
    }
}

/// Identifier of a topic: BLAKE2s-256 of the topic bytes
///
/// Used as the REGTOPIC/TOPICQUERY topic hash and as the target of the ID
/// search that locates hosts for the topic.
pub fn topic_id(topic: &[u8]) -> NodeId {
    NodeId::from_bytes(hash_to_id(topic))
}

fn hash_to_id(data: &[u8]) -> [u8; NODE_ID_SIZE] {
    let mut hasher = Blake2s256::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut id = [0u8; NODE_ID_SIZE];
    id.copy_from_slice(&digest);
    id
}
