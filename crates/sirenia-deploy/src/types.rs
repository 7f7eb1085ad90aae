//! Inputs and progress reports of a rollout.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sirenia_core::ServiceEvent;

/// A release as far as a rollout cares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Process types the release defines.
    #[serde(default)]
    pub processes: BTreeSet<String>,
}

/// A move from `old_release` to `new_release`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub old_release: Release,
    pub new_release: Release,
    /// Target job count per process type.
    #[serde(default)]
    pub processes: BTreeMap<String, u32>,
    /// Job counts the new release is currently scaled to.
    #[serde(default)]
    pub new_formation: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Starting,
    Up,
    Stopping,
    Down,
}

/// Lifecycle change of one job, as reported by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub release_id: String,
    pub process: String,
    pub state: JobState,
}

/// Everything a rollout listens to, merged into one stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployEvent {
    Service(ServiceEvent),
    Job(JobEvent),
}

/// Progress report emitted while a rollout runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub release_id: String,
    pub process: String,
    pub job_state: JobState,
}
