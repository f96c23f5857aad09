//! Error types for step execution.

use crate::step::StepInterface;
use roundhouse_common::Verb;
use roundhouse_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    #[error("driver '{driver}' has no {interface} interface")]
    MissingInterface {
        driver: String,
        interface: StepInterface,
    },

    #[error("verb '{0}' does not run steps")]
    UnsupportedVerb(Verb),

    #[error("no continuation record on node {0}")]
    MissingContinuation(Uuid),

    #[error("continuation on node {0} belongs to a different transition")]
    VerbMismatch(Uuid),

    #[error("power operation failed: {0}")]
    Power(String),

    #[error("step execution failed: {0}")]
    Execution(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
