//! Versioned peer records
//!
//! A [`Record`] is the simulator's stand-in for an Ethereum Node Record: the
//! address, identifier, sequence number and metadata a peer advertises about
//! itself. Records are immutable values. Updating a peer builds a new record
//! with a larger sequence, and whoever holds the old one must replace it.

use crate::node_id::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sequence number of a freshly created record
pub const DEFAULT_SEQ: u64 = 1;

/// Well-known metadata keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKey {
    /// Attestation subnet bitfield
    Subnet,
}

impl MetaKey {
    /// Wire key of this metadata entry
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            MetaKey::Subnet => &[1],
        }
    }
}

/// Peer descriptor: address, identifier, sequence and metadata
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    address: String,
    id: NodeId,
    seq: u64,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Record {
    /// Create a first-version record with empty metadata
    pub fn new(address: impl Into<String>, id: NodeId) -> Self {
        Record {
            address: address.into(),
            id,
            seq: DEFAULT_SEQ,
            meta: BTreeMap::new(),
        }
    }

    /// Create a record with an explicit sequence and metadata
    ///
    /// A sequence of 0 is raised to [`DEFAULT_SEQ`].
    pub fn with_meta(
        address: impl Into<String>,
        id: NodeId,
        seq: u64,
        meta: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Self {
        Record {
            address: address.into(),
            id,
            seq: seq.max(DEFAULT_SEQ),
            meta,
        }
    }

    /// Build the next version of this record, keeping address and identifier
    pub fn with_update(&self, seq: u64, meta: BTreeMap<Vec<u8>, Vec<u8>>) -> Self {
        Record::with_meta(self.address.clone(), self.id, seq, meta)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn meta(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.meta
    }

    /// Look up a well-known metadata entry
    pub fn meta_value(&self, key: MetaKey) -> Option<&[u8]> {
        self.meta.get(key.as_bytes()).map(Vec::as_slice)
    }

    /// True if `self` is a newer version of the same peer than `other`
    pub fn supersedes(&self, other: &Record) -> bool {
        self.id == other.id && self.seq > other.seq
    }

    /// Short label for logs, `#` followed by 6 hex chars of the identifier
    pub fn short_id(&self) -> String {
        format!("#{}", &self.id.to_hex()[..6])
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record[{} seq={}]", self.short_id(), self.seq)
    }
}
