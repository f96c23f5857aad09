//! Error types for membership and ring operations.

use roundhouse_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RingError {
    /// Heartbeat write kept failing after local retries
    #[error("membership write failed after {attempts} attempts: {source}")]
    HeartbeatFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RingError>;
