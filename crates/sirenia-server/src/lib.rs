//! Peer process for sirenia-managed PostgreSQL.
//!
//! The [`api`] module serves a peer's status surface; [`config`] holds the
//! layered settings of the `sirenia-postgres` binary.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;

pub use api::{router, ApiError, AppState};
pub use config::{ConfigError, ServerConfig};
