//! Error types for the discoverd adapter.

use sirenia_core::CoreError;
use sirenia_state::StoreError;
use thiserror::Error;

/// Result type for discoverd operations.
pub type DiscoverdResult<T> = Result<T, DiscoverdError>;

/// Discoverd client errors.
#[derive(Error, Debug)]
pub enum DiscoverdError {
    /// A metadata write lost the compare-and-swap.
    #[error("service meta index {expected} is stale")]
    IndexStale { expected: u64 },

    /// The server could not be reached.
    #[error("discoverd unreachable: {0}")]
    Unreachable(String),

    /// The service or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected HTTP status.
    #[error("discoverd returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Transport failure.
    #[error("http error: {0}")]
    Http(reqwest::Error),

    /// The event stream broke or could not be reopened.
    #[error("event stream error: {0}")]
    Stream(String),

    /// Malformed payload.
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Cluster state could not be encoded.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl DiscoverdError {
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }
}

impl From<reqwest::Error> for DiscoverdError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Http(err)
        }
    }
}

impl From<DiscoverdError> for StoreError {
    fn from(err: DiscoverdError) -> Self {
        match err {
            DiscoverdError::IndexStale { expected } => Self::IndexStale {
                expected,
                current: expected,
            },
            other => Self::Unreachable(other.to_string()),
        }
    }
}
