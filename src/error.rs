//! Error taxonomy for the question-answering pipeline.
//!
//! Every fallible library operation returns [`QaError`]. Errors raised while
//! preparing or querying an index are wrapped in [`QaError::Stage`] so callers
//! can tell ingestion failures from retrieval failures; [`QaError::kind`]
//! looks through that wrapper and yields the flat [`ErrorKind`].
//!
//! | Kind | Scope |
//! |------|-------|
//! | `fetch`, `empty_document` | whole request |
//! | `dimension_mismatch`, `invalid_argument` | whole request, never retried |
//! | `embedding_service` | retried with backoff, then surfaced |
//! | `synthesis`, `no_context`, `timeout` | one question |

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the library.
pub type QaResult<T> = Result<T, QaError>;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Chunking, batch embedding, and index build for a document.
    Ingestion,
    /// Question embedding and index lookup.
    Retrieval,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Ingestion => write!(f, "ingestion"),
            Stage::Retrieval => write!(f, "retrieval"),
        }
    }
}

/// Flat error classification, serializable into answers and HTTP bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    EmptyDocument,
    EmbeddingService,
    DimensionMismatch,
    InvalidArgument,
    Synthesis,
    NoContext,
    Timeout,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::EmptyDocument => "empty_document",
            ErrorKind::EmbeddingService => "embedding_service",
            ErrorKind::DimensionMismatch => "dimension_mismatch",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Synthesis => "synthesis",
            ErrorKind::NoContext => "no_context",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the pipeline components.
#[derive(Debug, Error)]
pub enum QaError {
    /// The document could not be downloaded, read, or extracted.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The document has no extractable characters.
    #[error("document contains no extractable text")]
    EmptyDocument,

    /// The external embedding capability failed.
    #[error("embedding service error: {message}")]
    EmbeddingService { message: String, retryable: bool },

    /// Vectors compared in one index disagree on dimensionality.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A caller-supplied parameter is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The external completion capability failed or returned nothing usable.
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Synthesis was asked to answer without any passages.
    #[error("no context passages were supplied")]
    NoContext,

    /// The request budget ran out before this work finished.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the run before this work finished.
    #[error("cancelled by caller")]
    Cancelled,

    /// An inner error tagged with the stage that raised it.
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<QaError>,
    },
}

impl QaError {
    pub fn fetch(msg: impl Into<String>) -> Self {
        Self::Fetch(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    /// Embedding failure worth retrying (rate limit, server error, network).
    pub fn embedding_transient(msg: impl Into<String>) -> Self {
        Self::EmbeddingService {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Embedding failure that retrying cannot fix (bad request, bad response).
    pub fn embedding_fatal(msg: impl Into<String>) -> Self {
        Self::EmbeddingService {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Tag this error with `stage`. Already-tagged errors keep their original stage.
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            tagged @ QaError::Stage { .. } => tagged,
            other => QaError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The stage this error was tagged with, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            QaError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Taxonomy kind, looking through stage wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QaError::Fetch(_) => ErrorKind::Fetch,
            QaError::EmptyDocument => ErrorKind::EmptyDocument,
            QaError::EmbeddingService { .. } => ErrorKind::EmbeddingService,
            QaError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            QaError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            QaError::Synthesis(_) => ErrorKind::Synthesis,
            QaError::NoContext => ErrorKind::NoContext,
            QaError::Timeout(_) => ErrorKind::Timeout,
            QaError::Cancelled => ErrorKind::Cancelled,
            QaError::Stage { source, .. } => source.kind(),
        }
    }

    /// Only transient embedding-service failures are retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            QaError::EmbeddingService { retryable, .. } => *retryable,
            QaError::Stage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_stage() {
        let err = QaError::EmptyDocument.at_stage(Stage::Ingestion);
        assert_eq!(err.kind(), ErrorKind::EmptyDocument);
        assert_eq!(err.stage(), Some(Stage::Ingestion));
        assert_eq!(
            err.to_string(),
            "ingestion failed: document contains no extractable text"
        );
    }

    #[test]
    fn test_at_stage_keeps_first_tag() {
        let err = QaError::invalid("k must be >= 1")
            .at_stage(Stage::Retrieval)
            .at_stage(Stage::Ingestion);
        assert_eq!(err.stage(), Some(Stage::Retrieval));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_retryable_only_for_transient_embedding() {
        assert!(QaError::embedding_transient("429").is_retryable());
        assert!(!QaError::embedding_fatal("400").is_retryable());
        assert!(QaError::embedding_transient("503")
            .at_stage(Stage::Ingestion)
            .is_retryable());
        assert!(!QaError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!QaError::synthesis("boom").is_retryable());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DimensionMismatch).unwrap();
        assert_eq!(json, "\"dimension_mismatch\"");
        assert_eq!(ErrorKind::NoContext.to_string(), "no_context");
    }
}
