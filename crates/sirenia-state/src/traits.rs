use std::sync::Arc;

use async_trait::async_trait;
use sirenia_core::{Config, DatabaseInfo, DiscoverdState, Position, Tunables, XLog};
use tokio::sync::{mpsc, oneshot};

use crate::error::{DatabaseError, StoreError};
use crate::types::{DatabaseEvent, DiscoverdEvent};

/// A local database driven by a peer.
#[async_trait]
pub trait Database: Send + Sync {
    fn xlog(&self) -> Arc<dyn XLog>;

    async fn xlog_position(&self) -> Result<Position, DatabaseError>;

    /// Apply `config`. Must return immediately when `config` is equivalent to
    /// the last one applied.
    async fn reconfigure(&self, config: &Config) -> Result<(), DatabaseError>;

    async fn start(&self) -> Result<(), DatabaseError>;

    async fn stop(&self) -> Result<(), DatabaseError>;

    /// Receiver for the single readiness event. Only the first call yields a
    /// live receiver.
    fn ready(&self) -> oneshot::Receiver<DatabaseEvent>;

    async fn info(&self) -> DatabaseInfo;

    fn default_tunables(&self) -> Tunables;

    fn validate_tunables(&self, tunables: &Tunables) -> Result<(), DatabaseError>;
}

/// Shared cluster state store and membership feed.
#[async_trait]
pub trait Discoverd: Send + Sync {
    /// Compare-and-swap `state` against its index, returning the new index.
    async fn set_state(&self, state: DiscoverdState) -> Result<u64, StoreError>;

    /// The event stream. Only the first call yields a live receiver.
    fn events(&self) -> mpsc::UnboundedReceiver<DiscoverdEvent>;
}
