//! Collaborators a rollout drives.

use std::time::Duration;

use async_trait::async_trait;
use sirenia_client::{ClientResult, SireniaClient};
use sirenia_core::Instance;

use crate::error::DeployResult;

/// The scheduler's view of how many jobs each release runs.
#[async_trait]
pub trait Formation: Send + Sync {
    /// Scale `process` of `release` to `count` jobs.
    async fn scale(&self, release_id: &str, process: &str, count: u32) -> DeployResult<()>;
}

/// Access to running peers.
#[async_trait]
pub trait PeerControl: Send + Sync {
    async fn stop(&self, peer: &Instance) -> ClientResult<()>;

    /// Wait until `upstream` reports `downstream` as caught up.
    async fn wait_for_repl_sync(
        &self,
        upstream: &Instance,
        downstream: &Instance,
        timeout: Duration,
    ) -> ClientResult<()>;

    async fn wait_for_read_write(&self, peer: &Instance, timeout: Duration) -> ClientResult<()>;
}

/// [`PeerControl`] over each peer's HTTP status port.
#[derive(Debug, Clone, Copy, Default)]
pub struct SireniaPeers;

#[async_trait]
impl PeerControl for SireniaPeers {
    async fn stop(&self, peer: &Instance) -> ClientResult<()> {
        SireniaClient::for_database(&peer.addr)?.stop().await
    }

    async fn wait_for_repl_sync(
        &self,
        upstream: &Instance,
        downstream: &Instance,
        timeout: Duration,
    ) -> ClientResult<()> {
        SireniaClient::for_database(&upstream.addr)?
            .wait_for_repl_sync(downstream, timeout)
            .await
    }

    async fn wait_for_read_write(&self, peer: &Instance, timeout: Duration) -> ClientResult<()> {
        SireniaClient::for_database(&peer.addr)?
            .wait_for_read_write(timeout)
            .await
    }
}
