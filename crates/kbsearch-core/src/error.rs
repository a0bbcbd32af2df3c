use thiserror::Error;

/// Errors surfaced to callers of the retrieval pipeline.
///
/// Only the fatal (`RetrievalUnavailable`, `DimensionMismatch`) and
/// `InvalidInput` categories ever leave a search request; degraded stages and
/// fallback escalation are reported through the response instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Embedding dimension mismatch: index expects {expected}, provider returned {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation failed: {0}")]
    Operation(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::RetrievalUnavailable(_) | Error::DimensionMismatch { .. })
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
