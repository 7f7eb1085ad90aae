use sirenia_client::ClientError;
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("unable to determine sirenia process type")]
    UnknownProcessType,

    #[error("sirenia process type {0} not present in new release")]
    ProcessNotInRelease(String),

    #[error("new release already runs {0} sirenia jobs")]
    NewReleaseScaled(u32),

    #[error("sirenia cluster in unexpected state")]
    UnexpectedState,

    #[error("missing sirenia cluster state")]
    MissingState,

    #[error("sirenia cluster in singleton mode")]
    Singleton,

    #[error("sirenia cluster in unhealthy state ({0})")]
    Unhealthy(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("event stream closed unexpectedly")]
    StreamClosed,

    #[error("deployment stopped")]
    Stopped,

    #[error("decoding sirenia cluster state: {0}")]
    Decode(#[from] sirenia_core::CoreError),

    #[error("peer {addr}: {source}")]
    Peer {
        addr: String,
        #[source]
        source: ClientError,
    },

    #[error("formation error: {0}")]
    Formation(String),

    /// The rollout stopped part way through an ordered replacement that
    /// cannot be unwound; the deployment must not be rolled back.
    #[error("{0} (rollback skipped)")]
    SkipRollback(Box<DeployError>),
}

impl DeployError {
    pub fn formation(msg: impl Into<String>) -> Self {
        Self::Formation(msg.into())
    }

    pub(crate) fn peer(addr: &str, source: ClientError) -> Self {
        Self::Peer {
            addr: addr.to_owned(),
            source,
        }
    }

    /// Mark the error as non-rollbackable. Already marked errors are
    /// returned unchanged.
    #[must_use]
    pub fn skip_rollback(self) -> Self {
        match self {
            Self::SkipRollback(_) => self,
            other => Self::SkipRollback(Box::new(other)),
        }
    }

    #[must_use]
    pub fn is_skip_rollback(&self) -> bool {
        matches!(self, Self::SkipRollback(_))
    }

    /// The error beneath any rollback marker.
    #[must_use]
    pub fn cause(&self) -> &DeployError {
        match self {
            Self::SkipRollback(inner) => inner.cause(),
            other => other,
        }
    }
}
