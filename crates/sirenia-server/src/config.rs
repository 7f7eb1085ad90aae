//! Peer process configuration.
//!
//! Loaded from `sirenia.toml`, an optional explicit file and `SIRENIA_`
//! environment variables, with nested keys separated by `__`
//! (`SIRENIA_POSTGRES__PORT=6432`).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use sirenia_discoverd::DEFAULT_URL;
use sirenia_postgres::{PostgresConfig, ID_KEY};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("configuration error: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Status surface.
    #[serde(default)]
    pub http: HttpSettings,

    /// Identity of this peer.
    #[serde(default)]
    pub peer: PeerSettings,

    /// Local PostgreSQL process.
    #[serde(default)]
    pub postgres: PostgresConfig,

    /// Service discovery.
    #[serde(default)]
    pub discoverd: DiscoverdSettings,
}

impl ServerConfig {
    /// Load configuration from file and environment.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `sirenia.toml` in the current directory (if present)
    /// 3. The file at `path` (if provided)
    /// 4. Environment variables with the `SIRENIA_` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::file("sirenia.toml"));

        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }

        let config: Self = figment
            .merge(Env::prefixed("SIRENIA_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.id.is_empty() {
            return Err(ConfigError::Invalid("peer.id must be set".into()));
        }
        if self.peer.id_key.is_empty() {
            return Err(ConfigError::Invalid("peer.id_key must not be empty".into()));
        }
        if self.discoverd.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid(
                "discoverd.heartbeat_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Address registered in discoverd: the advertised host and the
    /// postgres port. The status surface is expected one port above.
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.peer.advertise_host, self.postgres.port)
    }
}

/// Status surface settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

const fn default_listen_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5433)
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSettings {
    /// Logical id, stored in instance metadata under `id_key`.
    #[serde(default)]
    pub id: String,

    #[serde(default = "default_id_key")]
    pub id_key: String,

    /// Run as the only member of a frozen cluster.
    #[serde(default)]
    pub singleton: bool,

    /// Host other peers use to reach this one.
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            id_key: default_id_key(),
            singleton: false,
            advertise_host: default_advertise_host(),
        }
    }
}

fn default_id_key() -> String {
    ID_KEY.to_owned()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverdSettings {
    #[serde(default = "default_discoverd_url")]
    pub url: String,

    /// Service the peers register under.
    #[serde(default = "default_service")]
    pub service: String,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl DiscoverdSettings {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Default for DiscoverdSettings {
    fn default() -> Self {
        Self {
            url: default_discoverd_url(),
            service: default_service(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

fn default_discoverd_url() -> String {
    DEFAULT_URL.to_owned()
}

fn default_service() -> String {
    "postgres".to_owned()
}

const fn default_heartbeat_secs() -> u64 {
    5
}
