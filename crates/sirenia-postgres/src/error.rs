use sirenia_core::{Role, XLogError};
use sirenia_state::DatabaseError;
use thiserror::Error;

pub type PostgresResult<T> = Result<T, PostgresError>;

#[derive(Error, Debug)]
pub enum PostgresError {
    /// `pg_stat_replication` has no usable row for the downstream yet.
    #[error("no replication status")]
    NoReplicationStatus,

    #[error("postgres is not running")]
    NotRunning,

    #[error("postgres is already running")]
    AlreadyRunning,

    #[error("postgres is already stopped")]
    AlreadyStopped,

    #[error("postgres is unconfigured")]
    Unconfigured,

    #[error("start attempted with role 'none'")]
    StartWithoutRole,

    #[error("missing upstream peer")]
    MissingUpstream,

    #[error("missing downstream peer")]
    MissingDownstream,

    #[error("unknown role {0}")]
    UnknownRole(Role),

    /// The daemon is running in a role that cannot be promoted in place.
    #[error("cannot assume primary while running as {0}")]
    RunningAs(Role),

    #[error("unknown tunable: {0}")]
    UnknownTunable(String),

    #[error("unable to kill postgres")]
    UnableToKill,

    #[error("upstream is offline")]
    UpstreamOffline,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("{command} exited with {status}")]
    Command { command: String, status: String },

    #[error("signal error: {0}")]
    Signal(#[from] nix::Error),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    XLog(#[from] XLogError),
}

impl From<PostgresError> for DatabaseError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::NotRunning => Self::Offline,
            PostgresError::UnknownTunable(key) => Self::UnknownTunable(key),
            PostgresError::MissingUpstream
            | PostgresError::MissingDownstream
            | PostgresError::UnknownRole(_) => Self::invalid(err.to_string()),
            other => Self::driver(other.to_string()),
        }
    }
}
