use sirenia_core::{DiscoverdState, Instance};
use tokio::sync::{mpsc, watch};

/// One-shot readiness report from a database driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseEvent {
    /// The database process is already running.
    pub online: bool,
    /// A data directory existed before the driver started.
    pub setup: bool,
}

/// Events delivered by a [`Discoverd`](crate::Discoverd) implementation.
///
/// `Init` always comes first and exactly once.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoverdEvent {
    Init {
        peers: Vec<Instance>,
        state: DiscoverdState,
    },
    Peers(Vec<Instance>),
    State(DiscoverdState),
}

/// Synchronisation channels used by the deterministic simulator.
///
/// `rest` receives the number of external inputs (discoverd events and the
/// database ready signal) the peer had handled each time its loop goes idle.
/// `retry` receives a message wherever the peer would otherwise arm a retry
/// timer; no timer is armed while hooks are installed.
#[derive(Debug, Clone)]
pub struct PeerHooks {
    pub rest: watch::Sender<u64>,
    pub retry: mpsc::UnboundedSender<()>,
}
