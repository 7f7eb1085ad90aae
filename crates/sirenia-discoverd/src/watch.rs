//! Reconnecting service watch.
//!
//! A raw discoverd stream replays the full service as `up` and
//! `service_meta` events, then sends `current`, then live changes. When the
//! connection drops, [`Watch`] reconnects and diffs the replay against what
//! it already reported, so consumers see one continuous stream: instances
//! that vanished while disconnected produce `down`, changed instances
//! produce `update`, and nothing is repeated.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use sirenia_core::{EventKind, Instance, ServiceEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::Service;
use crate::error::{DiscoverdError, DiscoverdResult};
use crate::sse::SseDecoder;

const CONNECT_TOTAL: Duration = Duration::from_secs(30);
const CONNECT_DELAY: Duration = Duration::from_millis(200);
const EVENT_BUFFER: usize = 64;

/// Handle to a running watch. Dropping it stops the watch.
#[derive(Debug)]
pub struct Watch {
    events: mpsc::Receiver<ServiceEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<DiscoverdResult<()>>>,
}

impl Watch {
    pub(crate) fn spawn(service: Service) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(service, tx, cancel.clone()));
        Self {
            events: rx,
            cancel,
            task: Some(task),
        }
    }

    /// Next event, or `None` once the watch has ended.
    pub async fn next(&mut self) -> Option<ServiceEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait for the watch to end and report why it did.
    ///
    /// # Errors
    ///
    /// Returns the error that made reconnection give up.
    pub async fn finish(mut self) -> DiscoverdResult<()> {
        self.close();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|err| DiscoverdError::stream(err.to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    service: Service,
    tx: mpsc::Sender<ServiceEvent>,
    cancel: CancellationToken,
) -> DiscoverdResult<()> {
    let mut tracker = Tracker::default();
    loop {
        let response = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            response = connect(&service) => response?,
        };
        info!(service = %service.name(), "watch connected");

        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    warn!(service = %service.name(), error = %err, "watch stream failed");
                    break;
                }
                None => break,
            };
            for data in decoder.push(&chunk) {
                let event: ServiceEvent = match serde_json::from_str(&data) {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "skipping malformed discoverd event");
                        continue;
                    }
                };
                for event in tracker.observe(event) {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        info!(service = %service.name(), "watch disconnected, reconnecting");
        tracker.disconnected();
    }
}

/// Open the stream, retrying for a bounded time.
async fn connect(service: &Service) -> DiscoverdResult<reqwest::Response> {
    let deadline = tokio::time::Instant::now() + CONNECT_TOTAL;
    loop {
        match service.open_stream().await {
            Ok(response) => return Ok(response),
            Err(err) if tokio::time::Instant::now() + CONNECT_DELAY < deadline => {
                debug!(error = %err, "watch connect failed, retrying");
                tokio::time::sleep(CONNECT_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Deduplication state carried across reconnects.
#[derive(Debug, Default)]
pub(crate) struct Tracker {
    instances: HashMap<String, Instance>,
    leader: Option<String>,
    meta_index: Option<u64>,
    /// Instances replayed since the last connect, before `current`.
    replayed: HashSet<String>,
    is_current: bool,
}

impl Tracker {
    pub(crate) fn disconnected(&mut self) {
        self.is_current = false;
        self.replayed.clear();
    }

    /// Turn one raw event into the events to forward.
    pub(crate) fn observe(&mut self, mut event: ServiceEvent) -> Vec<ServiceEvent> {
        match event.kind {
            EventKind::Current => {
                let gone: Vec<Instance> = self
                    .instances
                    .iter()
                    .filter(|(id, _)| !self.replayed.contains(*id))
                    .map(|(_, inst)| inst.clone())
                    .collect();
                self.is_current = true;
                let mut out: Vec<ServiceEvent> = gone
                    .into_iter()
                    .map(|inst| {
                        self.instances.remove(&inst.id);
                        ServiceEvent::instance(event.service.clone(), EventKind::Down, inst)
                    })
                    .collect();
                out.push(event);
                return out;
            }
            EventKind::Up => {
                let Some(inst) = event.instance.clone() else {
                    return Vec::new();
                };
                if !self.is_current {
                    self.replayed.insert(inst.id.clone());
                }
                let previous = self.instances.insert(inst.id.clone(), inst.clone());
                match previous {
                    Some(_) if self.is_current => {}
                    None => {}
                    Some(prev) if prev == inst => return Vec::new(),
                    Some(_) => event.kind = EventKind::Update,
                }
            }
            EventKind::Update => {
                if let Some(inst) = &event.instance {
                    self.instances.insert(inst.id.clone(), inst.clone());
                }
            }
            EventKind::Down => {
                if let Some(inst) = &event.instance {
                    self.instances.remove(&inst.id);
                }
            }
            EventKind::Leader => {
                let id = event.instance.as_ref().map(|inst| inst.id.clone());
                if !self.is_current && self.leader.is_some() && self.leader == id {
                    return Vec::new();
                }
                self.leader = id;
            }
            EventKind::ServiceMeta => {
                let index = event.service_meta.as_ref().map(|meta| meta.index);
                if !self.is_current && self.meta_index.is_some() && self.meta_index == index {
                    return Vec::new();
                }
                self.meta_index = index;
            }
        }
        vec![event]
    }
}
