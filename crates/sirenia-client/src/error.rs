use thiserror::Error;

/// Result type for client calls.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// A wait reached its deadline before the peer reported the
    /// expected status.
    #[error("timeout waiting for expected status")]
    Timeout,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The peer answered with a non-success status. `message` is the
    /// `error` field of the body when there is one.
    #[error("peer returned {status}: {message}")]
    Status { status: u16, message: String },
}

impl ClientError {
    /// Whether the error came from a deadline rather than the peer.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}
