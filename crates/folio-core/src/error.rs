use std::time::Duration;

use folio_index::IndexError;
use folio_index::document::{DocumentError, DocumentId};
use folio_llm::EmbedError;

/// Failure class of an [`EngineError`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller error; retrying with the same input fails again.
    MalformedInput,
    /// Transient; the operation may be retried later.
    EmbeddingUnavailable,
    /// Stored state contradicts itself. Not retryable.
    IndexConsistency,
    GenerationUnavailable,
    Cancelled,
    Timeout,
    NotFound,
    /// The input duplicates something already stored.
    Conflict,
    Storage,
}

impl ErrorKind {
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable | Self::GenerationUnavailable | Self::Timeout | Self::Storage
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(#[source] EmbedError),

    #[error("index consistency violation: {0}")]
    IndexConsistency(String),

    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("document {0} not found")]
    NotFound(DocumentId),

    #[error("content already ingested as document {0}")]
    Duplicate(DocumentId),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedInput(_) => ErrorKind::MalformedInput,
            Self::EmbeddingUnavailable(_) => ErrorKind::EmbeddingUnavailable,
            Self::IndexConsistency(_) => ErrorKind::IndexConsistency,
            Self::GenerationUnavailable(_) => ErrorKind::GenerationUnavailable,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Duplicate(_) => ErrorKind::Conflict,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::Consistency(msg) => Self::IndexConsistency(msg),
            IndexError::NotFound(id) => Self::NotFound(id),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<DocumentError> for EngineError {
    fn from(e: DocumentError) -> Self {
        match e {
            DocumentError::Io(io) => Self::Storage(io.to_string()),
            DocumentError::MalformedInput(msg) => Self::MalformedInput(msg),
            other => Self::MalformedInput(other.to_string()),
        }
    }
}

impl From<EmbedError> for EngineError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::DimensionMismatch { .. } => Self::IndexConsistency(e.to_string()),
            other => Self::EmbeddingUnavailable(other),
        }
    }
}
