//! DHT error types

use crate::node_id::NodeId;
use thiserror::Error;

/// DHT-specific errors
///
/// Every variant is a caller bug. Missing data (unknown record, empty bucket)
/// is reported as `None` or an empty list, never as an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DhtError {
    #[error("Home record mismatch: table is keyed to {expected}, got {actual}")]
    HomeMismatch { expected: NodeId, actual: NodeId },

    #[error("Invalid distance divisor: {0}")]
    InvalidDistanceDivisor(usize),

    #[error("Invalid buckets count: {0}, tables need one bucket per log-distance")]
    InvalidBucketsCount(usize),
}

/// Result type for DHT operations
pub type Result<T> = std::result::Result<T, DhtError>;
