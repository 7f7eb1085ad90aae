//! Client and adapter tests against an in-process discoverd.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use futures::{stream, Stream, StreamExt};
use parking_lot::Mutex;
use sirenia_core::{
    DiscoverdState, EventKind, Instance, PgXLog, ServiceEvent, ServiceMeta, State, XLog,
};
use sirenia_discoverd::{DiscoverdClient, DiscoverdError, Heartbeater, ServiceDiscoverd};
use sirenia_state::{Discoverd, DiscoverdEvent, StoreError};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

#[derive(Default)]
struct Fake {
    instances: Vec<Instance>,
    meta: Option<ServiceMeta>,
    next_index: u64,
    subscribers: Vec<mpsc::UnboundedSender<ServiceEvent>>,
}

impl Fake {
    fn broadcast(&mut self, event: ServiceEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

type Shared = Arc<Mutex<Fake>>;

async fn instances(AxumState(fake): AxumState<Shared>) -> Json<Vec<Instance>> {
    Json(fake.lock().instances.clone())
}

async fn add_instance(
    AxumState(fake): AxumState<Shared>,
    Path((service, id)): Path<(String, String)>,
    Json(mut inst): Json<Instance>,
) -> StatusCode {
    let mut fake = fake.lock();
    if fake.instances.iter().any(|i| i.id == id) {
        return StatusCode::OK;
    }
    fake.next_index += 1;
    inst.index = fake.next_index;
    fake.instances.push(inst.clone());
    fake.broadcast(ServiceEvent::instance(service, EventKind::Up, inst));
    StatusCode::OK
}

async fn remove_instance(
    AxumState(fake): AxumState<Shared>,
    Path((service, id)): Path<(String, String)>,
) -> StatusCode {
    let mut fake = fake.lock();
    let Some(pos) = fake.instances.iter().position(|i| i.id == id) else {
        return StatusCode::NOT_FOUND;
    };
    let inst = fake.instances.remove(pos);
    fake.broadcast(ServiceEvent::instance(service, EventKind::Down, inst));
    StatusCode::OK
}

async fn get_meta(AxumState(fake): AxumState<Shared>) -> impl IntoResponse {
    match fake.lock().meta.clone() {
        Some(meta) => Json(meta).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn set_meta(
    AxumState(fake): AxumState<Shared>,
    Path(service): Path<String>,
    Json(mut meta): Json<ServiceMeta>,
) -> impl IntoResponse {
    let mut fake = fake.lock();
    let current = fake.meta.as_ref().map_or(0, |m| m.index);
    if meta.index != current {
        return StatusCode::PRECONDITION_FAILED.into_response();
    }
    fake.next_index += 1;
    meta.index = fake.next_index;
    fake.meta = Some(meta.clone());
    fake.broadcast(ServiceEvent::meta(service, meta.clone()));
    Json(meta).into_response()
}

async fn watch(
    AxumState(fake): AxumState<Shared>,
    Path(service): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut snapshot: Vec<ServiceEvent> = Vec::new();
    {
        let mut fake = fake.lock();
        for inst in &fake.instances {
            snapshot.push(ServiceEvent::instance(service.clone(), EventKind::Up, inst.clone()));
        }
        if let Some(meta) = &fake.meta {
            snapshot.push(ServiceEvent::meta(service.clone(), meta.clone()));
        }
        snapshot.push(ServiceEvent::current(service));
        fake.subscribers.push(tx);
    }
    let live = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) });
    let events = stream::iter(snapshot)
        .chain(live)
        .map(|event| Ok(Event::default().data(serde_json::to_string(&event).unwrap())));
    Sse::new(events)
}

async fn serve() -> (DiscoverdClient, Shared) {
    let fake: Shared = Arc::default();
    let app = Router::new()
        .route("/services/{service}", get(watch))
        .route("/services/{service}/instances", get(instances))
        .route(
            "/services/{service}/instances/{id}",
            put(add_instance).delete(remove_instance),
        )
        .route("/services/{service}/meta", get(get_meta).put(set_meta))
        .with_state(Arc::clone(&fake));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (DiscoverdClient::new(&addr.to_string()).unwrap(), fake)
}

fn inst(id: &str, n: u8) -> Instance {
    Instance {
        id: id.to_owned(),
        addr: format!("10.0.0.{n}:5432"),
        proto: "tcp".to_owned(),
        ..Instance::default()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<DiscoverdEvent>) -> DiscoverdEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

#[tokio::test]
async fn meta_writes_compare_and_swap() {
    let (client, _fake) = serve().await;
    let service = client.service("pg");
    assert!(service.get_meta().await.unwrap().is_none());

    let stored = service
        .set_meta(&ServiceMeta {
            index: 0,
            data: serde_json::json!({"generation": 1}),
        })
        .await
        .unwrap();
    assert_eq!(stored.index, 1);

    let err = service
        .set_meta(&ServiceMeta {
            index: 0,
            data: serde_json::Value::Null,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoverdError::IndexStale { expected: 0 }));
    assert_eq!(service.get_meta().await.unwrap().unwrap(), stored);
}

#[tokio::test]
async fn adapter_turns_the_watch_into_peer_events() {
    let (client, _fake) = serve().await;
    let service = client.service("pg");
    service.register(&inst("a", 1)).await.unwrap();
    service.register(&inst("b", 2)).await.unwrap();

    let discoverd = ServiceDiscoverd::spawn(service.clone());
    let mut events = discoverd.events();
    let DiscoverdEvent::Init { peers, state } = next_event(&mut events).await else {
        panic!("first event must be init");
    };
    let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert_eq!(state, DiscoverdState::default());

    let cluster = State {
        generation: 1,
        primary: peers[0].clone(),
        sync: Some(peers[1].clone()),
        init_wal: PgXLog.zero(),
        ..State::default()
    };
    let index = discoverd
        .set_state(DiscoverdState {
            index: 0,
            state: Some(cluster.clone()),
        })
        .await
        .unwrap();
    assert_eq!(next_event(&mut events).await, DiscoverdEvent::State(DiscoverdState {
        index,
        state: Some(cluster.clone()),
    }));

    service.register(&inst("c", 3)).await.unwrap();
    let DiscoverdEvent::Peers(peers) = next_event(&mut events).await else {
        panic!("expected peers");
    };
    assert_eq!(peers.len(), 3);

    let err = discoverd
        .set_state(DiscoverdState {
            index: 0,
            state: Some(cluster),
        })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        StoreError::IndexStale {
            expected: 0,
            current: index
        }
    );

    service.unregister("a").await.unwrap();
    let DiscoverdEvent::Peers(peers) = next_event(&mut events).await else {
        panic!("expected peers");
    };
    let ids: Vec<_> = peers.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, ["b", "c"]);
    discoverd.close();
}

#[tokio::test]
async fn heartbeater_registers_and_unregisters() {
    let (client, _fake) = serve().await;
    let service = client.service("pg");
    let heartbeat = Heartbeater::start(service.clone(), inst("a", 1), Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(service.instances().await.unwrap().len(), 1);

    heartbeat.stop().await.unwrap();
    assert!(service.instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_server_is_reported() {
    let client = DiscoverdClient::new("127.0.0.1:1").unwrap();
    let err = client.service("pg").instances().await.unwrap_err();
    assert!(matches!(err, DiscoverdError::Unreachable(_)), "{err:?}");
}
