//! [`Discoverd`] implementation backed by a discoverd service.

use async_trait::async_trait;
use parking_lot::Mutex;
use sirenia_core::{DiscoverdState, EventKind, Instance, ServiceEvent, ServiceMeta, State};
use sirenia_state::{Discoverd, DiscoverdEvent, StoreError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::Service;
use crate::error::DiscoverdError;

/// Feeds a peer from a service watch and writes cluster state as service
/// metadata.
#[derive(Debug)]
pub struct ServiceDiscoverd {
    service: Service,
    events: Mutex<Option<mpsc::UnboundedReceiver<DiscoverdEvent>>>,
    cancel: CancellationToken,
}

impl ServiceDiscoverd {
    /// Start watching `service`. Events are buffered until the peer asks
    /// for them.
    pub fn spawn(service: Service) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let mut watch = service.watch();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut translator = Translator::default();
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = watch.next() => event,
                    };
                    let Some(event) = event else {
                        break;
                    };
                    if let Some(event) = translator.handle(event) {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                if let Err(err) = watch.finish().await {
                    error!(error = %err, "discoverd watch ended");
                }
            }
        });
        Self {
            service,
            events: Mutex::new(Some(rx)),
            cancel,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ServiceDiscoverd {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Discoverd for ServiceDiscoverd {
    async fn set_state(&self, state: DiscoverdState) -> Result<u64, StoreError> {
        let data = match &state.state {
            Some(s) => s
                .encode()
                .map_err(|err| StoreError::Unreachable(err.to_string()))?,
            None => serde_json::Value::Null,
        };
        let meta = ServiceMeta {
            index: state.index,
            data,
        };
        match self.service.set_meta(&meta).await {
            Ok(stored) => Ok(stored.index),
            Err(DiscoverdError::IndexStale { expected }) => {
                let current = match self.service.get_meta().await {
                    Ok(meta) => meta.map_or(0, |m| m.index),
                    Err(_) => expected,
                };
                Err(StoreError::IndexStale { expected, current })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn events(&self) -> mpsc::UnboundedReceiver<DiscoverdEvent> {
        self.events.lock().take().unwrap_or_else(|| {
            warn!("discoverd events already taken");
            mpsc::unbounded_channel().1
        })
    }
}

/// Folds service events into peer events.
///
/// Nothing is emitted until the `current` marker, which produces `Init`
/// with everything seen so far. Peers are ordered by presence index.
#[derive(Debug, Default)]
pub(crate) struct Translator {
    peers: Vec<Instance>,
    state: DiscoverdState,
    initialised: bool,
}

impl Translator {
    pub(crate) fn handle(&mut self, event: ServiceEvent) -> Option<DiscoverdEvent> {
        match event.kind {
            EventKind::Up | EventKind::Update => {
                let inst = event.instance?;
                match self.peers.iter_mut().find(|peer| peer.id == inst.id) {
                    Some(peer) => *peer = inst,
                    None => self.peers.push(inst),
                }
                self.peers.sort_by_key(|peer| peer.index);
                self.peers_event()
            }
            EventKind::Down => {
                let inst = event.instance?;
                let before = self.peers.len();
                self.peers.retain(|peer| peer.id != inst.id);
                if self.peers.len() == before {
                    return None;
                }
                self.peers_event()
            }
            EventKind::ServiceMeta => {
                let meta = event.service_meta?;
                if meta.index <= self.state.index && self.state.index != 0 {
                    debug!(index = meta.index, current = self.state.index, "ignoring stale service meta");
                    return None;
                }
                let state = match State::decode(&meta.data) {
                    Ok(state) => state,
                    Err(err) => {
                        error!(index = meta.index, error = %err, "undecodable cluster state");
                        return None;
                    }
                };
                self.state = DiscoverdState {
                    index: meta.index,
                    state,
                };
                self.initialised
                    .then(|| DiscoverdEvent::State(self.state.clone()))
            }
            EventKind::Current if !self.initialised => {
                self.initialised = true;
                Some(DiscoverdEvent::Init {
                    peers: self.peers.clone(),
                    state: self.state.clone(),
                })
            }
            EventKind::Current | EventKind::Leader => None,
        }
    }

    fn peers_event(&self) -> Option<DiscoverdEvent> {
        self.initialised
            .then(|| DiscoverdEvent::Peers(self.peers.clone()))
    }
}
