use thiserror::Error;

/// Errors surfaced by stores and the coordination layer.
///
/// Absent keys and compare-and-swap mismatches are not errors: they are
/// reported through `Option`/`bool` results so lock contention stays cheap.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or transport failure. The core never retries these on the
    /// caller's behalf.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The session (lease) backing a key is gone.
    #[error("session lost: {0}")]
    SessionLost(String),

    #[error("backend not supported: {0}")]
    BackendNotSupported(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid ttl: {0}")]
    InvalidTtl(String),

    /// The backend answered with something it should not have.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the error reflects an unreachable backend rather than a bad request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
