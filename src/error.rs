use std::io;
use std::path::PathBuf;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error taxonomy for the topic-clustering pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no episode topic files found in {}", dir.display())]
    NoInputs { dir: PathBuf },

    #[error("malformed record {}: {reason}", path.display())]
    MalformedRecord { path: PathBuf, reason: String },

    #[error("embedding dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("embedding backend error (HTTP {status}): {body}")]
    EmbeddingBackend { status: u16, body: String },

    #[error("naming backend error (HTTP {status}): {body}")]
    NamingBackend { status: u16, body: String },

    #[error("rate limit still exceeded after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },

    #[error("network error persisted after retries: {reason}")]
    NetworkTransient { reason: String },

    #[error("no topics to cluster")]
    EmptyInput,

    #[error("target cluster count must be positive")]
    TargetZero,

    #[error("output directory {} is locked by another process", dir.display())]
    LockHeld { dir: PathBuf },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the run can continue after this error (logged and skipped).
    ///
    /// Everything else aborts the pipeline without writing artifacts.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedRecord { .. } | PipelineError::NamingBackend { .. }
        )
    }
}
