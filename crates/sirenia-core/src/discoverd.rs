//! Service discovery data model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An addressable peer as registered with service discovery.
///
/// `id` is assigned per registration and changes when a job is replaced. The
/// stable logical identity lives in `meta` under a configurable key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance id.
    pub id: String,
    /// Wire address, `host:port`.
    pub addr: String,
    /// Protocol, usually `tcp`.
    pub proto: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    /// Presence index; later registrations have larger values.
    #[serde(default)]
    pub index: u64,
}

impl Instance {
    /// Look up a metadata value.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// The logical identity stored under `id_key`, or the empty string.
    #[must_use]
    pub fn logical_id(&self, id_key: &str) -> &str {
        self.meta(id_key).unwrap_or_default()
    }

    /// Host part of the address.
    #[must_use]
    pub fn host(&self) -> &str {
        self.addr
            .rsplit_once(':')
            .map_or(self.addr.as_str(), |(host, _)| host)
    }

    /// Port part of the address.
    #[must_use]
    pub fn port(&self) -> &str {
        self.addr.rsplit_once(':').map_or("", |(_, port)| port)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.addr, self.id)
    }
}

/// Compare two optional instances by discovery instance id.
#[must_use]
pub fn same_instance(a: Option<&Instance>, b: Option<&Instance>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id == b.id,
        (None, None) => true,
        _ => false,
    }
}

/// Opaque service metadata with its compare-and-swap index.
///
/// An index of zero means the metadata does not exist yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMeta {
    /// Version used for optimistic concurrency.
    #[serde(default, alias = "Index")]
    pub index: u64,
    /// Raw payload.
    #[serde(default, alias = "Data")]
    pub data: serde_json::Value,
}

/// Kinds of event emitted by a service watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An instance registered.
    Up,
    /// An instance went away.
    Down,
    /// An instance changed its metadata.
    Update,
    /// The service leader changed.
    Leader,
    /// The initial snapshot is complete.
    Current,
    /// Service metadata changed.
    ServiceMeta,
}

impl EventKind {
    /// Wire name of the event kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Update => "update",
            Self::Leader => "leader",
            Self::Current => "current",
            Self::ServiceMeta => "service_meta",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single service watch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    /// Service name.
    #[serde(default)]
    pub service: String,
    /// What happened.
    pub kind: EventKind,
    /// The instance concerned, for instance events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<Instance>,
    /// New metadata, for `service_meta` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_meta: Option<ServiceMeta>,
}

impl ServiceEvent {
    /// Build an instance event.
    #[must_use]
    pub fn instance(service: impl Into<String>, kind: EventKind, instance: Instance) -> Self {
        Self {
            service: service.into(),
            kind,
            instance: Some(instance),
            service_meta: None,
        }
    }

    /// Build the `current` marker.
    #[must_use]
    pub fn current(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            kind: EventKind::Current,
            instance: None,
            service_meta: None,
        }
    }

    /// Build a metadata event.
    #[must_use]
    pub fn meta(service: impl Into<String>, meta: ServiceMeta) -> Self {
        Self {
            service: service.into(),
            kind: EventKind::ServiceMeta,
            instance: None,
            service_meta: Some(meta),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn instance(id: &str, addr: &str) -> Instance {
        Instance {
            id: id.to_owned(),
            addr: addr.to_owned(),
            proto: "tcp".to_owned(),
            meta: BTreeMap::from([("POSTGRES_ID".to_owned(), "node1".to_owned())]),
            index: 1,
        }
    }

    #[test]
    fn splits_host_and_port() {
        let inst = instance("a", "10.0.0.1:5432");
        assert_eq!(inst.host(), "10.0.0.1");
        assert_eq!(inst.port(), "5432");
        assert_eq!(inst.logical_id("POSTGRES_ID"), "node1");
        assert_eq!(inst.logical_id("MISSING"), "");
    }

    #[test]
    fn same_instance_compares_ids_only() {
        let a = instance("a", "10.0.0.1:5432");
        let moved = instance("a", "10.0.0.9:5432");
        let b = instance("b", "10.0.0.1:5432");
        assert!(same_instance(Some(&a), Some(&moved)));
        assert!(!same_instance(Some(&a), Some(&b)));
        assert!(!same_instance(Some(&a), None));
        assert!(same_instance(None, None));
    }

    #[test]
    fn decodes_watch_event() {
        let raw = r#"{
            "service": "pg",
            "kind": "up",
            "instance": {"id": "x", "addr": "10.0.0.2:5432", "proto": "tcp",
                         "meta": {"SIRENIA_RELEASE_ID": "r2"}, "index": 7}
        }"#;
        let event: ServiceEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.kind, EventKind::Up);
        let inst = event.instance.unwrap();
        assert_eq!(inst.meta("SIRENIA_RELEASE_ID"), Some("r2"));
        assert_eq!(inst.index, 7);
    }

    #[test]
    fn service_meta_accepts_capitalised_fields() {
        let meta: ServiceMeta = serde_json::from_str(r#"{"Index": 3, "Data": {"a": 1}}"#).unwrap();
        assert_eq!(meta.index, 3);
        assert_eq!(meta.data["a"], 1);
    }
}
