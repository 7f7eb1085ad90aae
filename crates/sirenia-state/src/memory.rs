use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sirenia_core::{DiscoverdState, Instance};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::traits::Discoverd;
use crate::types::DiscoverdEvent;

/// In-process discoverd: a compare-and-swap cell for the cluster state plus
/// an ordered peer list, fanned out to every started client.
#[derive(Debug, Clone, Default)]
pub struct MemoryDiscoverd {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: DiscoverdState,
    peers: Vec<Instance>,
    subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::UnboundedSender<DiscoverdEvent>,
    delivered: Arc<AtomicU64>,
    started: bool,
}

impl Subscriber {
    fn notify(&self, event: DiscoverdEvent) {
        if !self.started {
            return;
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(event);
    }
}

impl MemoryDiscoverd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. It receives nothing until [`MemoryDiscoverdClient::start`].
    pub fn client(&self) -> MemoryDiscoverdClient {
        let (tx, rx) = mpsc::unbounded_channel();
        let delivered = Arc::new(AtomicU64::new(0));
        let mut inner = self.inner.lock();
        inner.subscribers.push(Subscriber {
            tx,
            delivered: Arc::clone(&delivered),
            started: false,
        });
        MemoryDiscoverdClient {
            store: self.clone(),
            slot: inner.subscribers.len() - 1,
            events: Mutex::new(Some(rx)),
            delivered,
        }
    }

    pub fn cluster_state(&self) -> DiscoverdState {
        self.inner.lock().state.clone()
    }

    pub fn peers(&self) -> Vec<Instance> {
        self.inner.lock().peers.clone()
    }

    /// Add a peer at the end of the list with the next presence index.
    /// Returns `None` if an instance with the same id is already present.
    pub fn peer_joined(&self, mut instance: Instance) -> Option<Instance> {
        let mut inner = self.inner.lock();
        if inner.peers.iter().any(|peer| peer.id == instance.id) {
            warn!(addr = %instance.addr, "peer already exists");
            return None;
        }
        instance.index = inner.peers.last().map_or(1, |last| last.index + 1);
        inner.peers.push(instance.clone());
        debug!(addr = %instance.addr, index = instance.index, "peer joined");

        let peers = inner.peers.clone();
        for subscriber in &inner.subscribers {
            subscriber.notify(DiscoverdEvent::Peers(peers.clone()));
        }
        Some(instance)
    }

    /// Remove the first peer matching `predicate`.
    pub fn peer_removed(&self, predicate: impl Fn(&Instance) -> bool) -> Option<Instance> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.peers.iter().position(predicate) else {
            warn!("peer not present");
            return None;
        };
        let removed = inner.peers.remove(pos);
        debug!(addr = %removed.addr, "peer removed");

        let peers = inner.peers.clone();
        for subscriber in &inner.subscribers {
            subscriber.notify(DiscoverdEvent::Peers(peers.clone()));
        }
        Some(removed)
    }

    /// Write `state` if its index matches the stored one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexStale`] when the index does not match.
    pub fn set_cluster_state(&self, state: DiscoverdState) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        if inner.state.index != state.index {
            return Err(StoreError::IndexStale {
                expected: state.index,
                current: inner.state.index,
            });
        }
        inner.state = DiscoverdState {
            index: state.index + 1,
            state: state.state,
        };
        let snapshot = inner.state.clone();
        for subscriber in &inner.subscribers {
            subscriber.notify(DiscoverdEvent::State(snapshot.clone()));
        }
        Ok(snapshot.index)
    }
}

/// One peer's view of a [`MemoryDiscoverd`].
#[derive(Debug)]
pub struct MemoryDiscoverdClient {
    store: MemoryDiscoverd,
    slot: usize,
    events: Mutex<Option<mpsc::UnboundedReceiver<DiscoverdEvent>>>,
    delivered: Arc<AtomicU64>,
}

impl MemoryDiscoverdClient {
    /// Deliver the `Init` event and start forwarding changes.
    pub fn start(&self) {
        let mut inner = self.store.inner.lock();
        let event = DiscoverdEvent::Init {
            peers: inner.peers.clone(),
            state: inner.state.clone(),
        };
        if let Some(subscriber) = inner.subscribers.get_mut(self.slot) {
            subscriber.started = true;
            subscriber.notify(event);
        }
    }

    /// Number of events handed to this client so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &MemoryDiscoverd {
        &self.store
    }
}

#[async_trait]
impl Discoverd for MemoryDiscoverdClient {
    async fn set_state(&self, state: DiscoverdState) -> Result<u64, StoreError> {
        self.store.set_cluster_state(state)
    }

    fn events(&self) -> mpsc::UnboundedReceiver<DiscoverdEvent> {
        self.events.lock().take().unwrap_or_else(|| {
            let (_, rx) = mpsc::unbounded_channel();
            rx
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sirenia_core::State;

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_owned(),
            addr: format!("{id}:5432"),
            proto: "tcp".to_owned(),
            ..Instance::default()
        }
    }

    #[test]
    fn assigns_increasing_indexes_and_rejects_duplicates() {
        let store = MemoryDiscoverd::new();
        assert_eq!(store.peer_joined(instance("a")).unwrap().index, 1);
        assert_eq!(store.peer_joined(instance("b")).unwrap().index, 2);
        assert!(store.peer_joined(instance("a")).is_none());

        store.peer_removed(|p| p.id == "b").unwrap();
        assert_eq!(store.peer_joined(instance("b")).unwrap().index, 2);
    }

    #[test]
    fn state_writes_are_compare_and_swap() {
        let store = MemoryDiscoverd::new();
        let state = DiscoverdState {
            index: 0,
            state: Some(State {
                generation: 1,
                primary: instance("a"),
                ..State::default()
            }),
        };
        assert_eq!(store.set_cluster_state(state.clone()).unwrap(), 1);
        assert_eq!(
            store.set_cluster_state(state).unwrap_err(),
            StoreError::IndexStale {
                expected: 0,
                current: 1
            }
        );
    }

    #[tokio::test]
    async fn clients_receive_init_then_changes() {
        let store = MemoryDiscoverd::new();
        store.peer_joined(instance("a"));
        let client = store.client();
        let mut events = client.events();

        store.peer_joined(instance("b"));
        assert_eq!(client.delivered(), 0);

        client.start();
        match events.recv().await.unwrap() {
            DiscoverdEvent::Init { peers, state } => {
                assert_eq!(peers.len(), 2);
                assert_eq!(state.index, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        store.peer_removed(|p| p.id == "a");
        assert!(matches!(
            events.recv().await.unwrap(),
            DiscoverdEvent::Peers(peers) if peers.len() == 1
        ));
        assert_eq!(client.delivered(), 2);
    }

    #[test]
    fn events_can_only_be_taken_once() {
        let store = MemoryDiscoverd::new();
        let client = store.client();
        let _first = client.events();
        let mut second = client.events();
        assert!(second.try_recv().is_err());
    }
}
