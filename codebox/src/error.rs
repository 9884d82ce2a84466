//! Engine-level error type.
//!
//! These errors describe failures of the engine itself (spawning the worker,
//! touching the artifact root, a closed worker pool). Failures of the submitted
//! code are never errors: they are [`ExecutionOutcome`](crate::outcome::ExecutionOutcome)
//! variants handed back to the caller.

use std::path::PathBuf;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed worker payload: {0}")]
    WorkerProtocol(String),

    #[error("Worker pool has been shut down")]
    PoolClosed,

    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Dataset not readable at {path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True when the error is caused by the caller's input rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidArtifactName(_)
                | EngineError::ArtifactNotFound(_)
                | EngineError::Dataset { .. }
        )
    }
}
