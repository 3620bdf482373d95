//! Simulation tunables

use crate::{
    AD_LIFETIME_ROUNDS, AD_RETRY_MAX_ROUNDS, FORGET_CHANCE, LOOKUP_MAX_QUERIES,
    NEIGHBOR_DISTANCES_LIMIT, PARALLELISM,
};
use discsim_dht::{TableConfig, BUCKETS_COUNT, K, MAX_NODES_PER_MESSAGE};
use serde::{Deserialize, Serialize};

/// Peer and table configuration shared by every node of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Records per bucket (Kademlia k)
    pub bucket_size: usize,

    /// Number of log-distances before coarsening
    pub buckets_count: usize,

    /// Distance coarsening divisor, 1 disables it
    pub distance_divisor: usize,

    /// Chance (0.0 - 1.0) that a PING goes unanswered
    pub forget_chance: f64,

    /// Rounds an accepted ad stays on its host
    pub ad_lifetime_rounds: usize,

    /// Longest ticket wait an advertiser accepts before giving up on a host
    pub ad_retry_max_rounds: usize,

    /// Parallelism of searches, queues and lookups (alpha)
    pub parallelism: usize,

    /// Bucket distances asked for in one FINDNODE
    pub neighbor_distances_limit: usize,

    /// Records per NODES reply
    pub nodes_per_message: usize,

    /// Re-queries one iterative search may issue before it stops
    pub lookup_max_queries: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bucket_size: K,
            buckets_count: BUCKETS_COUNT,
            distance_divisor: 1,
            forget_chance: FORGET_CHANCE,
            ad_lifetime_rounds: AD_LIFETIME_ROUNDS,
            ad_retry_max_rounds: AD_RETRY_MAX_ROUNDS,
            parallelism: PARALLELISM,
            neighbor_distances_limit: NEIGHBOR_DISTANCES_LIMIT,
            nodes_per_message: MAX_NODES_PER_MESSAGE,
            lookup_max_queries: LOOKUP_MAX_QUERIES,
        }
    }
}

impl SimConfig {
    /// Routing table shape for nodes built from this config
    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            bucket_size: self.bucket_size,
            buckets_count: self.buckets_count,
            distance_divisor: self.distance_divisor,
        }
    }

    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    pub fn with_distance_divisor(mut self, divisor: usize) -> Self {
        self.distance_divisor = divisor;
        self
    }

    /// Set the PING forget chance, clamped to 0.0 - 1.0
    ///
    /// A non-finite chance is stored as 0.0.
    pub fn with_forget_chance(mut self, chance: f64) -> Self {
        self.forget_chance = sanitize_chance(chance);
        self
    }

    /// PING forget chance as a usable probability
    ///
    /// The field is public and may be deserialized, so it is clamped again
    /// here; NaN and infinities read as 0.0.
    pub fn effective_forget_chance(&self) -> f64 {
        sanitize_chance(self.forget_chance)
    }

    pub fn with_ad_lifetime_rounds(mut self, rounds: usize) -> Self {
        self.ad_lifetime_rounds = rounds;
        self
    }

    pub fn with_ad_retry_max_rounds(mut self, rounds: usize) -> Self {
        self.ad_retry_max_rounds = rounds;
        self
    }

    /// Set parallelism, at least 1
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_lookup_max_queries(mut self, queries: usize) -> Self {
        self.lookup_max_queries = queries;
        self
    }
}

fn sanitize_chance(chance: f64) -> f64 {
    if chance.is_finite() {
        chance.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
