//! Driver settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Metadata key holding a peer's logical id.
pub const ID_KEY: &str = "POSTGRES_ID";

/// PostgreSQL process settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// Port postgres listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding `postgres`, `initdb` and `pg_basebackup`.
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Password of the replication superuser.
    #[serde(default = "default_password")]
    pub password: String,

    /// Bound on starting and stopping the daemon, per signal when stopping.
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,

    /// How long a downstream may go without flushing more log before the
    /// sync wait gives up.
    #[serde(default = "default_repl_timeout_secs")]
    pub repl_timeout_secs: u64,

    /// Wait for the upstream to report healthy before taking a base backup.
    #[serde(default)]
    pub wait_upstream: bool,

    /// Load `pgextwlist` and restrict extensions to a fixed list.
    #[serde(default)]
    pub ext_whitelist: bool,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bin_dir: default_bin_dir(),
            data_dir: default_data_dir(),
            password: default_password(),
            op_timeout_secs: default_op_timeout_secs(),
            repl_timeout_secs: default_repl_timeout_secs(),
            wait_upstream: false,
            ext_whitelist: false,
        }
    }
}

impl PostgresConfig {
    #[must_use]
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    #[must_use]
    pub fn repl_timeout(&self) -> Duration {
        Duration::from_secs(self.repl_timeout_secs)
    }

    pub(crate) fn bin_path(&self, file: &str) -> PathBuf {
        self.bin_dir.join(file)
    }

    pub(crate) fn data_path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        self.data_path("postgresql.conf")
    }

    pub(crate) fn recovery_conf_path(&self) -> PathBuf {
        self.data_path("recovery.conf")
    }

    pub(crate) fn hba_conf_path(&self) -> PathBuf {
        self.data_path("pg_hba.conf")
    }

    pub(crate) fn trigger_path(&self) -> PathBuf {
        self.data_path("promote.trigger")
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Who the driver is running for.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Logical id of the local peer.
    pub id: String,
    /// Metadata key other peers' logical ids are stored under.
    pub id_key: String,
    /// A singleton primary runs without a downstream.
    pub singleton: bool,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            id_key: ID_KEY.to_owned(),
            singleton: false,
        }
    }

    #[must_use]
    pub fn with_id_key(mut self, id_key: impl Into<String>) -> Self {
        self.id_key = id_key.into();
        self
    }

    #[must_use]
    pub fn singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }
}

const fn default_port() -> u16 {
    5432
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("/usr/lib/postgresql/9.5/bin")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_password() -> String {
    "password".to_owned()
}

const fn default_op_timeout_secs() -> u64 {
    300
}

const fn default_repl_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: PostgresConfig =
            serde_json::from_value(serde_json::json!({"port": 6000, "wait_upstream": true}))
                .unwrap();
        assert_eq!(config.port, 6000);
        assert!(config.wait_upstream);
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.op_timeout(), Duration::from_secs(300));
        assert_eq!(config.repl_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.config_path(),
            PathBuf::from("/data/postgresql.conf")
        );
    }
}
