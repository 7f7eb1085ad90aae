//! Error types for sirenia-core.

use crate::xlog::XLogError;

/// Result type alias using [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while handling the shared data model.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Transaction log position could not be parsed or compared.
    #[error(transparent)]
    XLog(#[from] XLogError),

    /// Cluster state could not be encoded or decoded.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}
