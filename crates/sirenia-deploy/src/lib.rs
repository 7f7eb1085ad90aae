//! Deployment controller for sirenia clusters.
//!
//! [`SireniaDeploy`] moves a chain onto a new release one peer at a time,
//! never leaving the cluster without a writable primary. It drives the
//! scheduler through [`Formation`] and the peers through [`PeerControl`],
//! and follows progress on a merged stream of discovery and job events.

#![forbid(unsafe_code)]

mod config;
mod error;
mod sirenia;
mod traits;
mod types;

pub use config::DeployConfig;
pub use error::{DeployError, DeployResult};
pub use sirenia::SireniaDeploy;
pub use traits::{Formation, PeerControl, SireniaPeers};
pub use types::{DeployEvent, Deployment, DeploymentEvent, JobEvent, JobState, Release};
