//! Error types for conductor operations.

use roundhouse_common::{ProvisionState, Verb};
use roundhouse_engine::EngineError;
use roundhouse_ring::RingError;
use roundhouse_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConductorError {
    /// Another live conductor holds the reservation; retry elsewhere
    #[error("node {node} is locked by conductor '{holder}'")]
    NodeLocked { node: Uuid, holder: String },

    /// The ring assigns this node to a different live conductor
    #[error("node {node} is not owned by this conductor")]
    NotOwner { node: Uuid },

    /// Optimistic-version races exhausted the local retry budget
    #[error("gave up updating node {node} after repeated version conflicts")]
    Conflict { node: Uuid },

    #[error("verb '{verb}' is not allowed from state '{state}'")]
    InvalidStateTransition { state: ProvisionState, verb: Verb },

    #[error("node {node} is in maintenance")]
    NodeInMaintenance { node: Uuid },

    /// The node is not suspended awaiting an agent callback
    #[error("node {node} is not waiting for an agent callback")]
    NotWaiting { node: Uuid },

    /// The presented token does not match the one issued at suspension
    #[error("agent token mismatch for node {node}")]
    TokenMismatch { node: Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Ring(#[from] RingError),
}

impl ConductorError {
    /// Ownership and locking errors are expected under normal
    /// concurrent operation; callers retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConductorError::NodeLocked { .. }
                | ConductorError::NotOwner { .. }
                | ConductorError::Conflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
