//! Deployment settings.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DeployConfig {
    /// Bound on every wait during a rollout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Release environment variable naming the sirenia process type.
    #[serde(default = "default_process_env_key")]
    pub process_env_key: String,

    /// Instance metadata key holding the release a job belongs to.
    #[serde(default = "default_release_meta_key")]
    pub release_meta_key: String,

    /// Instance metadata key holding a job's process type.
    #[serde(default = "default_process_meta_key")]
    pub process_meta_key: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            process_env_key: default_process_env_key(),
            release_meta_key: default_release_meta_key(),
            process_meta_key: default_process_meta_key(),
        }
    }
}

impl DeployConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const fn default_timeout_secs() -> u64 {
    180
}

fn default_process_env_key() -> String {
    "SIRENIA_PROCESS".to_owned()
}

fn default_release_meta_key() -> String {
    "SIRENIA_RELEASE_ID".to_owned()
}

fn default_process_meta_key() -> String {
    "SIRENIA_PROCESS_TYPE".to_owned()
}
