//! Cluster state, roles and driver configuration.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::discoverd::{same_instance, Instance};
use crate::error::CoreResult;
use crate::xlog::Position;

/// Freeze reason recorded when a cluster is bootstrapped in singleton mode.
pub const SINGLETON_FREEZE_REASON: &str = "cluster started in singleton mode";

/// Why and when the cluster was frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeDetails {
    /// When the freeze was requested.
    pub frozen_at: DateTime<Utc>,
    /// Operator-supplied reason.
    pub reason: String,
}

impl FreezeDetails {
    /// Create freeze details stamped with `at`.
    #[must_use]
    pub fn new(reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            frozen_at: at,
            reason: reason.into(),
        }
    }
}

/// Versioned, database-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Monotonic version; each update must bump it by one.
    #[serde(default)]
    pub version: u64,
    /// Setting name to value.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Tunables {
    /// Whether no tunables have ever been set.
    #[must_use]
    pub fn is_unset(&self) -> bool {
        self.version == 0 && self.data.is_empty()
    }
}

/// The authoritative cluster state stored in discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Strictly monotone generation counter.
    pub generation: u64,
    /// Present while generation changes are suspended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeze: Option<FreezeDetails>,
    /// Primary-only operation with no replication.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub singleton: bool,
    /// Log position at which this generation began.
    pub init_wal: Position,
    /// Head of the chain.
    pub primary: Instance,
    /// Synchronous replica; absent only in singleton mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<Instance>,
    /// Asynchronous tail of the chain, in order.
    #[serde(
        rename = "async",
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "nullable_vec"
    )]
    pub asyncs: Vec<Instance>,
    /// Former primaries whose data is stale.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "nullable_vec"
    )]
    pub deposed: Vec<Instance>,
    /// Database settings shared by every member.
    #[serde(default, skip_serializing_if = "Tunables::is_unset")]
    pub tunables: Tunables,
}

fn nullable_vec<'de, D>(deserializer: D) -> Result<Vec<Instance>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Instance>>::deserialize(deserializer)?.unwrap_or_default())
}

impl State {
    /// Decode a state from discovery metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a valid state.
    pub fn decode(data: &serde_json::Value) -> CoreResult<Option<Self>> {
        if data.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(data.clone())?))
    }

    /// Encode the state for storage in discovery metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if serialisation fails.
    pub fn encode(&self) -> CoreResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Whether generation changes are suspended.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.freeze.is_some()
    }

    /// Every instance named by the state in chain order, followed by the
    /// deposed peers.
    pub fn members(&self) -> impl Iterator<Item = &Instance> {
        std::iter::once(&self.primary)
            .chain(self.sync.iter())
            .chain(self.asyncs.iter())
            .chain(self.deposed.iter())
    }
}

/// The role a peer plays in the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Head of the chain, accepts writes.
    Primary,
    /// Synchronous replica of the primary.
    Sync,
    /// Asynchronous replica further down the chain.
    Async,
    /// Not named by the state.
    Unassigned,
    /// Former primary with stale data.
    Deposed,
    /// Driver-only role: the database should be stopped.
    None,
    /// Not yet determined.
    #[default]
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Primary => "primary",
            Self::Sync => "sync",
            Self::Async => "async",
            Self::Unassigned => "unassigned",
            Self::Deposed => "deposed",
            Self::None => "none",
        }
    }

    /// Whether the role participates in replication.
    #[must_use]
    pub const fn is_chain_member(self) -> bool {
        matches!(self, Self::Primary | Self::Sync | Self::Async)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Database driver input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Target role.
    pub role: Role,
    /// Replication source, for sync and async.
    #[serde(default)]
    pub upstream: Option<Instance>,
    /// Replication target, if any.
    #[serde(default)]
    pub downstream: Option<Instance>,
    /// Cluster state the config was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    /// Database settings to apply.
    #[serde(default)]
    pub tunables: Tunables,
}

impl Config {
    /// A config that stops the database.
    #[must_use]
    pub fn none() -> Self {
        Self {
            role: Role::None,
            ..Self::default()
        }
    }

    /// Whether applying `other` over `self` would change nothing.
    ///
    /// Peers are compared by discovery instance id; tunables by version.
    /// A neighbour that restarts under the same logical id but a new
    /// instance id therefore makes the configs differ, even though eval
    /// resolves chain positions by logical id.
    #[must_use]
    pub fn equivalent(&self, other: &Self) -> bool {
        self.role == other.role
            && same_instance(self.upstream.as_ref(), other.upstream.as_ref())
            && same_instance(self.downstream.as_ref(), other.downstream.as_ref())
            && self.tunables.version == other.tunables.version
    }

    /// Whether `other` keeps the upstream but names a different, present
    /// downstream.
    #[must_use]
    pub fn is_new_downstream(&self, other: &Self) -> bool {
        same_instance(self.upstream.as_ref(), other.upstream.as_ref())
            && other.downstream.is_some()
            && !same_instance(self.downstream.as_ref(), other.downstream.as_ref())
    }

    /// Whether `other` differs from `self` only by newer tunables.
    #[must_use]
    pub fn is_tunables_update(&self, other: &Self) -> bool {
        self.role == other.role
            && same_instance(self.upstream.as_ref(), other.upstream.as_ref())
            && same_instance(self.downstream.as_ref(), other.downstream.as_ref())
            && self.tunables.version < other.tunables.version
    }
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.equivalent(other)
    }
}

/// Cluster state together with its compare-and-swap index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverdState {
    /// Opaque version for optimistic concurrency.
    pub index: u64,
    /// The state, absent before bootstrap.
    #[serde(default)]
    pub state: Option<State>,
}

/// Observable snapshot of a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Logical id of the peer.
    pub id: String,
    /// Current role.
    pub role: Role,
    /// Set while a failed driver reconfigure is waiting to be retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_pending: Option<DateTime<Utc>>,
    /// Last cluster state seen.
    #[serde(default)]
    pub state: Option<State>,
    /// Present peers in discovery order; absent until discovery initialises.
    #[serde(default)]
    pub peers: Option<Vec<Instance>>,
}
