use thiserror::Error;

/// Error taxonomy for the extraction engine.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Upstream answered 429.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Upstream answered 403; repeated occurrences indicate a soft block.
    #[error("Forbidden (HTTP 403)")]
    Forbidden,

    /// Upstream answered with a 5xx status.
    #[error("Upstream server error (HTTP {status})")]
    Server { status: u16 },

    /// Any other non-success status.
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    /// Network/connection error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Authentication was rejected at session start.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Partition specification is malformed or ambiguous.
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),

    /// Retry budget for a single request ran out.
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<HarvestError>,
    },

    /// Filesystem failure in the sink or checkpoint store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Checkpoint could not be read back.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker task panicked or was aborted.
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// How the retry policy treats the outcome of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    RateLimited,
    Forbidden,
    Server,
    Transport,
    /// Not worth retrying, but not run-ending either (e.g. HTTP 400/404).
    Rejected,
    Fatal,
}

impl HarvestError {
    /// Returns true if this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::AuthFailed(_)
                | HarvestError::InvalidPartition(_)
                | HarvestError::Config(_)
                | HarvestError::Checkpoint(_)
        )
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.response_class(),
            ResponseClass::RateLimited
                | ResponseClass::Forbidden
                | ResponseClass::Server
                | ResponseClass::Transport
        )
    }

    pub fn response_class(&self) -> ResponseClass {
        match self {
            HarvestError::RateLimited => ResponseClass::RateLimited,
            HarvestError::Forbidden => ResponseClass::Forbidden,
            HarvestError::Server { .. } => ResponseClass::Server,
            HarvestError::Transport(_) | HarvestError::Timeout(_) => ResponseClass::Transport,
            HarvestError::Http { status, .. } => match status {
                429 => ResponseClass::RateLimited,
                403 => ResponseClass::Forbidden,
                500..=599 => ResponseClass::Server,
                _ => ResponseClass::Rejected,
            },
            HarvestError::ExhaustedRetries { .. } => ResponseClass::Rejected,
            e if e.is_fatal() => ResponseClass::Fatal,
            _ => ResponseClass::Rejected,
        }
    }

    /// Map a non-success HTTP status to the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            401 => HarvestError::AuthFailed(message.into()),
            403 => HarvestError::Forbidden,
            429 => HarvestError::RateLimited,
            500..=599 => HarvestError::Server { status },
            _ => HarvestError::Http {
                status,
                message: message.into(),
            },
        }
    }
}
