//! K-bucket implementation for the simulated Kademlia table
//!
//! A bucket keeps records in recency order: the head is the least recently
//! touched, the tail the most recent. Inserting into a full bucket never
//! evicts on the spot. Instead the head is handed to a [`LivenessProbe`], and
//! the eviction is only applied when the probe reports back through
//! [`KBucket::resolve_eviction`], possibly several rounds later.

use crate::node_id::NodeId;
use crate::record::Record;
use std::collections::VecDeque;
use tracing::debug;

/// An insert waiting on a liveness check of the bucket head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEviction {
    /// Oldest record of the full bucket, the one being probed
    pub head: Record,

    /// Record that takes the head's place if the head turns out dead
    pub candidate: Record,
}

/// Liveness check supplied by the owner of a bucket
///
/// Implementations must not assume the answer is available synchronously;
/// they keep the [`PendingEviction`] and resolve it once the probe completes.
pub trait LivenessProbe {
    fn probe(&mut self, eviction: PendingEviction);
}

impl<F> LivenessProbe for F
where
    F: FnMut(PendingEviction),
{
    fn probe(&mut self, eviction: PendingEviction) {
        self(eviction)
    }
}

/// A k-bucket for storing records at a specific distance
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Bucket index (log-distance from the table owner)
    pub index: usize,

    /// Maximum number of records
    capacity: usize,

    /// Records, least recently touched first
    records: VecDeque<Record>,
}

impl KBucket {
    /// Create a new k-bucket
    pub fn new(index: usize, capacity: usize) -> Self {
        KBucket {
            index,
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    /// Get number of records in bucket
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if bucket is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get all records, head first
    pub fn records(&self) -> &VecDeque<Record> {
        &self.records
    }

    pub fn contains_id(&self, id: &NodeId) -> bool {
        self.records.iter().any(|r| r.id() == id)
    }

    /// Find record by ID
    pub fn find_by_id(&self, id: &NodeId) -> Option<&Record> {
        self.records.iter().find(|r| r.id() == id)
    }

    /// Insert or touch a record
    ///
    /// - Present: moved to the tail. If both versions differ, the one with the
    ///   larger sequence is kept.
    /// - Room left: appended to the tail.
    /// - Full: the head is handed to `probe` and nothing changes until the
    ///   probe answers via [`KBucket::resolve_eviction`].
    pub fn put<P>(&mut self, record: Record, probe: &mut P)
    where
        P: LivenessProbe + ?Sized,
    {
        if let Some(pos) = self.records.iter().position(|r| r.id() == record.id()) {
            let existing = self.records.remove(pos);
            let keep = match existing {
                Some(existing) if existing.seq() > record.seq() => existing,
                _ => record,
            };
            self.records.push_back(keep);
            return;
        }

        if !self.is_full() {
            self.records.push_back(record);
            return;
        }

        if let Some(head) = self.records.front() {
            probe.probe(PendingEviction {
                head: head.clone(),
                candidate: record,
            });
        }
    }

    /// Apply the answer of a liveness probe
    ///
    /// A live head keeps its slot and the candidate is dropped. A dead head is
    /// removed and the candidate appended if there is room for it. The bucket
    /// is re-read at this point, so a head already removed by another path is
    /// not an error. Returns true if the candidate was inserted.
    pub fn resolve_eviction(&mut self, eviction: PendingEviction, alive: bool) -> bool {
        if alive {
            debug!(
                "Bucket {}: head {} alive, dropping {}",
                self.index,
                eviction.head.short_id(),
                eviction.candidate.short_id()
            );
            return false;
        }

        self.remove(eviction.head.id());
        if self.contains_id(eviction.candidate.id()) || self.is_full() {
            return false;
        }

        debug!(
            "Bucket {}: evicted {} for {}",
            self.index,
            eviction.head.short_id(),
            eviction.candidate.short_id()
        );
        self.records.push_back(eviction.candidate);
        true
    }

    /// Remove a record from the bucket
    pub fn remove(&mut self, id: &NodeId) -> Option<Record> {
        let pos = self.records.iter().position(|r| r.id() == id)?;
        self.records.remove(pos)
    }
}
