use sirenia_core::XLogError;
use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cluster is frozen")]
    ClusterFrozen,

    #[error("database is offline")]
    DatabaseOffline,

    #[error("peer is not caught up")]
    PeerNotCaughtUp,

    #[error("peer is not the primary")]
    NotPrimary,

    #[error("tunables version must be {expected}, got {actual}")]
    TunablesVersion { expected: u64, actual: u64 },

    #[error("peer is already running")]
    AlreadyRunning,

    #[error("peer is stopped")]
    Stopped,

    #[error("discoverd event stream closed")]
    EventsClosed,

    #[error("database ready signal dropped")]
    ReadyDropped,

    #[error("discoverd error: {0}")]
    Discoverd(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    XLog(#[from] XLogError),
}

/// Failure shapes of a cluster state write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("index stale: expected {expected}, current {current}")]
    IndexStale { expected: u64, current: u64 },

    #[error("discoverd unreachable: {0}")]
    Unreachable(String),
}

/// Errors a database driver reports back to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    #[error("database is offline")]
    Offline,

    #[error("unknown tunable: {0}")]
    UnknownTunable(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{0}")]
    Driver(String),
}

impl DatabaseError {
    #[must_use]
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    #[must_use]
    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }
}

/// Why a simulator command did not run to completion.
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Rejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("peer task exited")]
    PeerExited,

    #[error("discoverd error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    XLog(#[from] XLogError),
}

impl SimulatorError {
    #[must_use]
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}
