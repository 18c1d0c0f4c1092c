#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("embedding backend error: {0}")]
    EmbedBackend(String),

    #[error("embedding circuit breaker is open")]
    CircuitOpen,

    #[error("run cancelled before commit")]
    Cancelled,

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConvergeError {
    /// Transient errors are worth retrying; everything else fails the run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::EmbedBackend(_))
    }
}
