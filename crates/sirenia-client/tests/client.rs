#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use sirenia_client::{ClientError, SireniaClient};
use sirenia_core::{DatabaseInfo, Instance, PeerInfo, Role, Status, Tunables};
use tokio::net::TcpListener;

#[derive(Default)]
struct FakePeer {
    status: Status,
    polls: u32,
    stopped: bool,
    tunables: Tunables,
}

type Shared = Arc<Mutex<FakePeer>>;

async fn status(AxumState(peer): AxumState<Shared>) -> Json<Status> {
    let mut peer = peer.lock();
    peer.polls += 1;
    // The database becomes writable and synced after a few polls.
    if peer.polls >= 3 {
        if let Some(db) = peer.status.database.as_mut() {
            db.read_write = true;
            db.synced_downstream = Some(inst("b"));
        }
    }
    Json(peer.status.clone())
}

async fn stop(AxumState(peer): AxumState<Shared>) -> StatusCode {
    peer.lock().stopped = true;
    StatusCode::OK
}

async fn get_tunables(AxumState(peer): AxumState<Shared>) -> Json<Tunables> {
    Json(peer.lock().tunables.clone())
}

async fn set_tunables(
    AxumState(peer): AxumState<Shared>,
    Json(tunables): Json<Tunables>,
) -> impl IntoResponse {
    let mut peer = peer.lock();
    if tunables.version != peer.tunables.version + 1 {
        let body = serde_json::json!({
            "error": format!("tunables version must be {}, got {}", peer.tunables.version + 1, tunables.version)
        });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }
    peer.tunables = tunables;
    StatusCode::OK.into_response()
}

fn inst(id: &str) -> Instance {
    Instance {
        id: id.to_owned(),
        addr: format!("{id}:5432"),
        proto: "tcp".to_owned(),
        ..Instance::default()
    }
}

async fn serve() -> (SireniaClient, Shared) {
    let peer: Shared = Arc::new(Mutex::new(FakePeer {
        status: Status {
            peer: Some(PeerInfo {
                id: "node1".to_owned(),
                role: Role::Primary,
                ..PeerInfo::default()
            }),
            database: Some(DatabaseInfo {
                running: true,
                ..DatabaseInfo::default()
            }),
        },
        tunables: Tunables {
            version: 1,
            data: BTreeMap::new(),
        },
        ..FakePeer::default()
    }));
    let app = Router::new()
        .route("/status", get(status))
        .route("/stop", post(stop))
        .route("/tunables", get(get_tunables).post(set_tunables))
        .with_state(Arc::clone(&peer));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (SireniaClient::new(&addr.to_string()).unwrap(), peer)
}

#[tokio::test]
async fn status_and_stop() {
    let (client, peer) = serve().await;
    let status = client.status().await.unwrap();
    assert_eq!(status.peer.unwrap().role, Role::Primary);
    assert!(status.database.unwrap().running);

    client.stop().await.unwrap();
    assert!(peer.lock().stopped);
}

#[tokio::test]
async fn waits_poll_until_the_condition_holds() {
    let (client, peer) = serve().await;
    client
        .wait_for_read_write(Duration::from_secs(5))
        .await
        .unwrap();
    client
        .wait_for_repl_sync(&inst("b"), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(peer.lock().polls >= 3);
}

#[tokio::test]
async fn waits_time_out() {
    let (client, _peer) = serve().await;
    let err = client
        .wait_for_repl_sync(&inst("c"), Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "timeout waiting for expected status");
}

#[tokio::test]
async fn tunables_round_trip_and_errors_carry_the_message() {
    let (client, _peer) = serve().await;
    let mut tunables = client.get_tunables().await.unwrap();
    assert_eq!(tunables.version, 1);

    tunables.version = 2;
    tunables
        .data
        .insert("shared_buffers".to_owned(), "64MB".to_owned());
    client.update_tunables(&tunables).await.unwrap();
    assert_eq!(client.get_tunables().await.unwrap(), tunables);

    let err = client.update_tunables(&tunables).await.unwrap_err();
    let ClientError::Status { status, message } = err else {
        panic!("expected status error, got {err:?}");
    };
    assert_eq!(status, 400);
    assert_eq!(message, "tunables version must be 3, got 2");
}

#[tokio::test]
async fn unreachable_peer_fails_waits_with_timeout() {
    let client = SireniaClient::new("127.0.0.1:1").unwrap();
    assert!(client.status().await.is_err());
    let err = client
        .wait_for_read_write(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}
