use thiserror::Error;

/// Core error type for the Trellis runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input rejected before any I/O
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Entity exists but its TTL has elapsed
    #[error("Expired: {0}")]
    Expired(String),

    /// Concurrent write lost (e.g. a newer summary already stored)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A bounded queue refused the job
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Upstream signalled a rate limit
    #[error("Rate limited: {0}")]
    RateLimit(String),

    /// Model, tool, MCP or knowledge backend failure
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    /// The caller's context was cancelled
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Expression compilation or evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Invariant violation inside the runtime
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`CoreError`], used for matching instead of message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid input
    Validation,
    /// Missing entity
    NotFound,
    /// Expired entity
    Expired,
    /// Lost concurrent write
    Conflict,
    /// Queue full
    Backpressure,
    /// Deadline exceeded
    Timeout,
    /// Rate limited
    RateLimit,
    /// External dependency failure
    Upstream,
    /// Context cancelled
    Cancelled,
    /// Everything else
    Internal,
}

impl CoreError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ValidationError(_) | CoreError::ConfigurationError(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Expired(_) => ErrorKind::Expired,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Backpressure(_) => ErrorKind::Backpressure,
            CoreError::Timeout(_) => ErrorKind::Timeout,
            CoreError::RateLimit(_) => ErrorKind::RateLimit,
            CoreError::UpstreamError(_) => ErrorKind::Upstream,
            CoreError::Cancelled(_) => ErrorKind::Cancelled,
            CoreError::StateStoreError(_)
            | CoreError::SerializationError(_)
            | CoreError::ExpressionError(_)
            | CoreError::IOError(_)
            | CoreError::Internal(_)
            | CoreError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Shorthand for `self.kind() == ErrorKind::RateLimit`.
    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimit
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

/// Result alias used across the runtime.
pub type Result<T> = std::result::Result<T, CoreError>;
