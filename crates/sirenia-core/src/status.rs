//! Status payload served on every peer's HTTP port.

use serde::{Deserialize, Serialize};

use crate::discoverd::Instance;
use crate::state::{Config, PeerInfo, Role};

/// What the local database driver knows about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Last config handed to the driver.
    #[serde(default)]
    pub config: Option<Config>,
    /// Whether the database process is running.
    #[serde(default)]
    pub running: bool,
    /// Current log position, empty when unknown.
    #[serde(default)]
    pub xlog: String,
    /// Whether the replication user has been created.
    #[serde(default)]
    pub user_exists: bool,
    /// Whether the database accepts writes.
    #[serde(default)]
    pub read_write: bool,
    /// Downstream that most recently caught up with this node.
    #[serde(default)]
    pub synced_downstream: Option<Instance>,
    /// Error encountered while gathering the above, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response body of `GET /status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// Peer snapshot.
    #[serde(default)]
    pub peer: Option<PeerInfo>,
    /// Database snapshot.
    #[serde(default)]
    pub database: Option<DatabaseInfo>,
}

impl Status {
    /// Whether the peer is a healthy chain member.
    ///
    /// Every member must hold a chain role, have no retry pending and run a
    /// database with the replication user created. The primary must also be
    /// writable and, outside singleton mode, synced with the sync named by
    /// the state.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let (Some(peer), Some(db)) = (&self.peer, &self.database) else {
            return false;
        };
        if !peer.role.is_chain_member() || peer.retry_pending.is_some() {
            return false;
        }
        if !db.running || !db.user_exists {
            return false;
        }
        if peer.role != Role::Primary {
            return true;
        }
        if !db.read_write {
            return false;
        }
        let Some(state) = &peer.state else {
            return false;
        };
        if state.singleton {
            return true;
        }
        match (&db.synced_downstream, &state.sync) {
            (Some(synced), Some(sync)) => synced.id == sync.id,
            _ => false,
        }
    }
}
