//! Simulation error types

use discsim_dht::DhtError;
use thiserror::Error;

/// Simulation errors
///
/// Every variant is API misuse and should abort the run. Lost messages, unknown
/// recipients and empty lookups are not errors; they surface as empty results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("Node tasks already initialized")]
    AlreadyInitialized,

    #[error("Result requested before task is over: {0}")]
    ResultNotReady(&'static str),

    #[error("Churn percent out of range: {0} (expected 0-100)")]
    ChurnOutOfRange(u8),

    #[error("Record sequence must grow: current {current}, requested {requested}")]
    StaleSequence { current: u64, requested: u64 },

    #[error("DHT error: {0}")]
    Dht(#[from] DhtError),
}

/// Result type for simulation operations
pub type Result<T> = std::result::Result<T, SimError>;
