//! Round-based simulation of Discovery v5 peers
//!
//! This crate drives the routing state of `discsim-dht` through a
//! single-threaded, cooperative round model:
//! - Peer state machine handling the eight discovery messages
//! - Simulated router with churn and traffic accounting
//! - Task engine (round-trips, bounded-parallel queues, producers)
//! - Iterative and parallel ID search
//! - Topic advertisement with ticket retry, and topic search
//! - Record metadata (subnet) search and table-wide ping showers
//!
//! ## Rounds
//!
//! Every call to [`Node::step`] advances each of the node's tasks by one
//! round. A request becomes a [`task::RoundTrip`]: delivered in one round,
//! handled by the recipient and answered in the next. Nodes are shared as
//! `Rc<RefCell<Node>>`; the [`Router`] only borrows the recipient while it
//! handles a message.

pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod router;
pub mod task;

pub use config::SimConfig;
pub use error::{Result, SimError};
pub use network::{Network, NetworkBuilder, TrafficStats};
pub use node::Node;
pub use router::Router;

/// Chance that a peer ignores a PING
pub const FORGET_CHANCE: f64 = 0.2;

/// Rounds an ad lives on its host
pub const AD_LIFETIME_ROUNDS: usize = 60;

/// Longest ticket wait (rounds) an advertiser accepts
pub const AD_RETRY_MAX_ROUNDS: usize = 10;

/// Parallelism of all multi-peer actions (alpha)
pub const PARALLELISM: usize = 3;

/// Bucket distances requested by one FINDNODE
pub const NEIGHBOR_DISTANCES_LIMIT: usize = 3;

/// Re-queries allowed to a single iterative search
pub const LOOKUP_MAX_QUERIES: usize = 32;
