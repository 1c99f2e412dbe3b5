//! Error taxonomy shared by every stage of the sync and retrieval pipeline.
//!
//! Errors fall into three groups:
//!
//! | Group | Variants | Handling |
//! |-------|----------|----------|
//! | Transient | `SourceUnavailable`, `EmbeddingUnavailable`, `IndexWriteFailure`, `IndexReadFailure` | retried with backoff, then reported per node |
//! | Per-node | `SourceNotFound`, `SourceRejected` | reported per node, never retried |
//! | Fatal | `EmbeddingDimensionMismatch`, `CheckpointWriteFailure`, `ConfigStore`, `InvalidConfig` | abort the sync cycle, no checkpoint written |

use thiserror::Error;

/// Result alias used across the core crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// The document source could not be reached (network, 429, 5xx, timeout).
    #[error("document source unavailable: {0}")]
    SourceUnavailable(String),

    /// The requested node does not exist upstream.
    #[error("source node not found: {0}")]
    SourceNotFound(String),

    /// The document source refused the request (bad token, malformed id).
    #[error("document source rejected request: {0}")]
    SourceRejected(String),

    /// The embedding provider could not produce vectors.
    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Vectors do not match the collection's fixed dimension.
    #[error("embedding dimension mismatch: collection expects {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },

    /// A vector index mutation failed.
    #[error("index write failed: {0}")]
    IndexWriteFailure(String),

    /// A vector index query failed.
    #[error("index read failed: {0}")]
    IndexReadFailure(String),

    /// The sync checkpoint could not be committed.
    #[error("checkpoint write failed: {0}")]
    CheckpointWriteFailure(String),

    /// The key/value config store failed on read.
    #[error("config store error: {0}")]
    ConfigStore(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn source_unavailable(msg: impl Into<String>) -> Self {
        Self::SourceUnavailable(msg.into())
    }

    pub fn source_not_found(msg: impl Into<String>) -> Self {
        Self::SourceNotFound(msg.into())
    }

    pub fn embedding_unavailable(msg: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable(msg.into())
    }

    pub fn index_write(msg: impl Into<String>) -> Self {
        Self::IndexWriteFailure(msg.into())
    }

    pub fn index_read(msg: impl Into<String>) -> Self {
        Self::IndexReadFailure(msg.into())
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_)
                | Self::EmbeddingUnavailable(_)
                | Self::IndexWriteFailure(_)
                | Self::IndexReadFailure(_)
        )
    }

    /// Whether the error invalidates the whole sync cycle rather than one node.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingDimensionMismatch { .. }
                | Self::CheckpointWriteFailure(_)
                | Self::ConfigStore(_)
                | Self::InvalidConfig(_)
        )
    }

    /// Short machine-readable code, used in reports and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::SourceNotFound(_) => "source_not_found",
            Self::SourceRejected(_) => "source_rejected",
            Self::EmbeddingUnavailable(_) => "embedding_unavailable",
            Self::EmbeddingDimensionMismatch { .. } => "embedding_dimension_mismatch",
            Self::IndexWriteFailure(_) => "index_write_failure",
            Self::IndexReadFailure(_) => "index_read_failure",
            Self::CheckpointWriteFailure(_) => "checkpoint_write_failure",
            Self::ConfigStore(_) => "config_store",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }
}
