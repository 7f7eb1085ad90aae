//! HTTP status surface of a peer.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sirenia_core::{Status, Tunables};
use sirenia_state::{Database, DatabaseError, Peer, StateError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared application state.
pub struct AppState {
    pub peer: Peer,
    pub db: Arc<dyn Database>,
    /// Cancelled once `/stop` has stopped the peer.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn status(&self) -> Status {
        Status {
            peer: Some(self.peer.info().as_ref().clone()),
            database: Some(self.db.info().await),
        }
    }
}

/// Creates the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/stop", post(stop))
        .route("/tunables", get(get_tunables).post(update_tunables))
        .with_state(state)
}

/// Peer and database snapshot. Always 200, even with the database down.
async fn status(State(state): State<Arc<AppState>>) -> Json<Status> {
    Json(state.status().await)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.status().await.is_healthy() {
        (StatusCode::OK, "Healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
    }
}

async fn stop(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    info!("stop requested");
    state.peer.stop().await.map_err(|err| {
        error!(error = %err, "error stopping peer");
        ApiError::internal(err)
    })?;
    state.shutdown.cancel();
    Ok(StatusCode::OK)
}

/// Tunables from the last cluster state seen, or the defaults before one
/// has been seen.
async fn get_tunables(State(state): State<Arc<AppState>>) -> Json<Tunables> {
    Json(
        state
            .peer
            .tunables()
            .unwrap_or_else(|| state.db.default_tunables()),
    )
}

async fn update_tunables(
    State(state): State<Arc<AppState>>,
    Json(tunables): Json<Tunables>,
) -> Result<StatusCode, ApiError> {
    let version = tunables.version;
    state.peer.update_tunables(tunables).await.map_err(|err| {
        warn!(version, error = %err, "tunables update rejected");
        ApiError::from(err)
    })?;
    info!(version, "tunables updated");
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// An error rendered as `{"error": ...}` with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn internal(err: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        let status = match &err {
            StateError::NotPrimary | StateError::ClusterFrozen => StatusCode::CONFLICT,
            StateError::TunablesVersion { .. }
            | StateError::Database(DatabaseError::UnknownTunable(_) | DatabaseError::Invalid(_)) => {
                StatusCode::BAD_REQUEST
            }
            StateError::DatabaseOffline | StateError::Database(DatabaseError::Offline) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
