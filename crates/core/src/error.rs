use crate::inference::ScoringError;
use crate::types::PartitionId;
use thiserror::Error;

pub type ChurnResult<T> = Result<T, ChurnError>;

#[derive(Error, Debug)]
pub enum ChurnError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or transport unavailable. Retried at the adapter boundary.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Unparseable event or missing required fields. Dead-lettered, never fatal.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Scoring error: {0}")]
    Scoring(#[from] ScoringError),

    /// Sink rejected the write or retries were exhausted.
    #[error("Prediction write failed: {0}")]
    WriteFailure(String),

    /// Reconstructed state disagrees with the durable checkpoint.
    #[error("State corruption on partition {partition}: {detail}")]
    StateCorruption { partition: PartitionId, detail: String },

    #[error("Checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ChurnError {
    /// Transient errors are absorbed and retried; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChurnError::Transport(_) | ChurnError::Checkpoint(_))
    }
}
