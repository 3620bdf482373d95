//! Discovery simulator DHT primitives
//!
//! This crate holds the routing state of a simulated Kademlia peer:
//! - 256-bit identifiers and the XOR log-distance metric
//! - Versioned peer records
//! - Fixed-capacity k-buckets with liveness-gated eviction
//! - The per-peer routing table
//! - The discovery message set and its traffic size estimates
//!
//! Nothing here knows about rounds or tasks; the `discsim-node` crate drives
//! these structures from its peer state machine.

pub mod error;
pub mod identity;
pub mod kbucket;
pub mod messages;
pub mod node_id;
pub mod record;
pub mod routing_table;

pub use error::{DhtError, Result};
pub use identity::{topic_id, NodeKey};
pub use kbucket::{KBucket, LivenessProbe, PendingEviction};
pub use messages::{Message, MessageType};
pub use node_id::{log_distance, sim_distance, NodeId, NODE_ID_BITS, NODE_ID_SIZE};
pub use record::{MetaKey, Record};
pub use routing_table::{filter_neighborhood, RoutingTable, TableConfig};

/// Kademlia k parameter (records per k-bucket)
pub const K: usize = 16;

/// Number of distinct log-distances, one bucket each
pub const BUCKETS_COUNT: usize = NODE_ID_BITS;

/// Maximum records carried by one NODES message
pub const MAX_NODES_PER_MESSAGE: usize = 4;
