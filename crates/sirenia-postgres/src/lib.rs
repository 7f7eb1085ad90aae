//! PostgreSQL driver for sirenia peers.
//!
//! [`Postgres`] implements [`sirenia_state::Database`] by supervising a
//! local `postgres` process: it renders `postgresql.conf` and
//! `recovery.conf`, seeds standbys with `pg_basebackup`, promotes syncs
//! through a trigger file and keeps the primary read-only until its
//! downstream has caught up.

#![forbid(unsafe_code)]

mod conf;
mod config;
mod daemon;
mod driver;
mod error;
mod sync;
pub mod tunables;

pub use config::{Identity, PostgresConfig, ID_KEY};
pub use driver::Postgres;
pub use error::{PostgresError, PostgresResult};
