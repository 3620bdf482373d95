//! Kademlia routing table

use crate::error::{DhtError, Result};
use crate::kbucket::{KBucket, LivenessProbe, PendingEviction};
use crate::node_id::{log_distance, sim_distance, NodeId, NODE_ID_BITS};
use crate::record::Record;
use crate::{BUCKETS_COUNT, K};
use std::collections::HashMap;
use tracing::debug;

/// Shape of a routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableConfig {
    /// Records per bucket (Kademlia k)
    pub bucket_size: usize,

    /// Number of log-distances before coarsening, at least [`NODE_ID_BITS`]
    pub buckets_count: usize,

    /// Coarsening divisor applied to every distance, 1 disables it
    pub distance_divisor: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            bucket_size: K,
            buckets_count: BUCKETS_COUNT,
            distance_divisor: 1,
        }
    }
}

/// Kademlia routing table scoped to one owning peer
///
/// Bucket `d` holds the records at (coarsened) distance `d` from the home
/// record, for `d` in `1..=bucket_count()`. Distance 0 is reserved for the
/// home record, which is never stored in a bucket.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Current record of the owning peer
    home: Record,

    config: TableConfig,

    /// One bucket per distance, `buckets[d - 1]` holds distance `d`
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(home: Record, config: TableConfig) -> Result<Self> {
        if config.distance_divisor == 0 {
            return Err(DhtError::InvalidDistanceDivisor(config.distance_divisor));
        }
        // Every log-distance must land in a bucket
        if config.buckets_count < NODE_ID_BITS {
            return Err(DhtError::InvalidBucketsCount(config.buckets_count));
        }

        let count = config.buckets_count.div_ceil(config.distance_divisor);
        let buckets = (1..=count)
            .map(|d| KBucket::new(d, config.bucket_size))
            .collect();

        Ok(RoutingTable {
            home,
            config,
            buckets,
        })
    }

    /// Get the owner's current record
    pub fn home(&self) -> &Record {
        &self.home
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Number of usable buckets after coarsening
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of records held
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    /// Bucket index of an identifier relative to the home record
    pub fn distance_to(&self, id: &NodeId) -> usize {
        sim_distance(self.home.id(), id, self.config.distance_divisor)
    }

    /// Get bucket by distance
    pub fn bucket(&self, distance: usize) -> Option<&KBucket> {
        distance.checked_sub(1).and_then(|idx| self.buckets.get(idx))
    }

    fn bucket_mut(&mut self, distance: usize) -> Option<&mut KBucket> {
        distance.checked_sub(1).and_then(|idx| self.buckets.get_mut(idx))
    }

    /// Insert or touch a record, see [`KBucket::put`]
    ///
    /// The home record is never inserted.
    pub fn put<P>(&mut self, record: Record, probe: &mut P)
    where
        P: LivenessProbe + ?Sized,
    {
        if record.id() == self.home.id() {
            return;
        }

        let distance = self.distance_to(record.id());
        if let Some(bucket) = self.bucket_mut(distance) {
            bucket.put(record, probe);
        }
    }

    /// Apply the answer of a liveness probe started by [`RoutingTable::put`]
    pub fn resolve_eviction(&mut self, eviction: PendingEviction, alive: bool) -> bool {
        let distance = self.distance_to(eviction.candidate.id());
        match self.bucket_mut(distance) {
            Some(bucket) => bucket.resolve_eviction(eviction, alive),
            None => false,
        }
    }

    /// All records at one distance; distance 0 yields the home record
    pub fn find(&self, distance: usize) -> Vec<Record> {
        if distance == 0 {
            return vec![self.home.clone()];
        }

        self.bucket(distance)
            .map(|bucket| bucket.records().iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records at each of the given distances, in request order
    pub fn find_many(&self, distances: &[usize]) -> Vec<Record> {
        distances.iter().flat_map(|&d| self.find(d)).collect()
    }

    /// Every record, grouped by distance in ascending bucket order
    pub fn find_all(&self) -> Vec<Record> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.records().iter().cloned())
            .collect()
    }

    /// Find a record by ID
    pub fn find_one(&self, id: &NodeId) -> Option<&Record> {
        if id == self.home.id() {
            return None;
        }

        self.bucket(self.distance_to(id))?.find_by_id(id)
    }

    /// Up to `limit` records walking down from `start` toward bucket 1
    pub fn find_down(&self, start: usize, limit: usize) -> Vec<Record> {
        if start == 0 {
            return vec![self.home.clone()];
        }

        let mut result = Vec::new();
        for distance in (1..=start.min(self.bucket_count())).rev() {
            if result.len() >= limit {
                break;
            }
            let records = self.find(distance);
            let needed = (limit - result.len()).min(records.len());
            result.extend(records.into_iter().take(needed));
        }
        result
    }

    /// Up to `limit` records surrounding `id`
    ///
    /// Starts at the bucket `id` falls into and widens one ring of buckets at
    /// a time, each ring sorted by distance to `id`.
    pub fn find_neighbors(&self, id: &NodeId, limit: usize) -> Vec<Record> {
        let start = self.distance_to(id);
        let top_limit = self.bucket_count();
        let mut result: Vec<Record> = Vec::new();
        let mut radius = 0;

        while result.len() < limit {
            let top = start + radius;
            let bottom = start.checked_sub(radius);
            if top > top_limit && bottom.map_or(true, |b| b < 1) {
                break;
            }

            let mut ring = Vec::new();
            if top <= top_limit {
                ring.extend(self.find(top));
            }
            if let Some(bottom) = bottom.filter(|&b| b >= 1 && b < top) {
                ring.extend(self.find(bottom));
            }

            let room = limit - result.len();
            result.extend(filter_neighborhood(id, ring, room));
            radius += 1;
        }

        result
    }

    /// Check whether a record with the same ID is held
    pub fn exists(&self, record: &Record) -> bool {
        self.find_one(record.id()).is_some()
    }

    /// Remove a record from the routing table
    pub fn remove(&mut self, id: &NodeId) -> Option<Record> {
        let distance = self.distance_to(id);
        self.bucket_mut(distance)?.remove(id)
    }

    /// Re-home the table after the owner's record changed
    ///
    /// The identifier must stay the same, so no bucket moves.
    pub fn update_home(&mut self, record: Record) -> Result<()> {
        if record.id() != self.home.id() {
            return Err(DhtError::HomeMismatch {
                expected: *self.home.id(),
                actual: *record.id(),
            });
        }

        debug!("Table {} re-homed to seq {}", self.home.short_id(), record.seq());
        self.home = record;
        Ok(())
    }
}

/// Closest `limit` distinct candidates to `center`
///
/// Candidates sharing an identifier collapse into the one with the larger
/// sequence. The sort is stable, so equally distant candidates keep their
/// input order. Candidates beyond `limit` are discarded.
pub fn filter_neighborhood<I>(center: &NodeId, candidates: I, limit: usize) -> Vec<Record>
where
    I: IntoIterator<Item = Record>,
{
    let mut positions: HashMap<NodeId, usize> = HashMap::new();
    let mut unique: Vec<Record> = Vec::new();

    for candidate in candidates {
        match positions.get(candidate.id()) {
            Some(&pos) => {
                if candidate.supersedes(&unique[pos]) {
                    unique[pos] = candidate;
                }
            }
            None => {
                positions.insert(*candidate.id(), unique.len());
                unique.push(candidate);
            }
        }
    }

    unique.sort_by_key(|record| log_distance(center, record.id()));
    unique.truncate(limit);
    unique
}
