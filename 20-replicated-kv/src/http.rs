//! HTTP API over a [`Coordinator`].
//!
//! | Route | Success | Errors |
//! |---|---|---|
//! | `POST /apply` (raw body) | 200 | 400 malformed, 421 not leader, 504 timeout, 503 engine |
//! | `GET /get?key=` | 200 `{"data": value}` | 400 missing key, 404 unknown key |
//! | `POST /add-node?followerId=&followerAddr=` | 200 | 400 rejected, 421 not leader |
//! | `POST /remove-node?followerId=` | 200 | 400 rejected, 421 not leader |
//! | `GET /status` | 200 node status | 503 node status with `failure` set |
//!
//! Coordinator calls block, so every handler runs them on the blocking pool.

use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::coordinator::Coordinator;
use crate::error::StoreError;

pub type SharedCoordinator = Arc<Coordinator>;

pub fn router(coordinator: SharedCoordinator) -> Router {
    Router::new()
        .route("/apply", post(apply))
        .route("/get", get(read))
        .route("/add-node", post(add_node))
        .route("/remove-node", post(remove_node))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    coordinator: SharedCoordinator,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(coordinator))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Error response with a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::MalformedCommand(_) | StoreError::MembershipChangeFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            StoreError::NotLeader { .. } => StatusCode::MISDIRECTED_REQUEST,
            StoreError::ConsensusTimeout => StatusCode::GATEWAY_TIMEOUT,
            StoreError::Consensus(_) | StoreError::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::JoinExhausted { .. }
            | StoreError::RestoreCorrupt(_)
            | StoreError::Config(_)
            | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        } else {
            debug!(status = %self.status, error = %self.message, "request rejected");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Runs a blocking coordinator call off the async executor.
async fn blocking<T, F>(coordinator: SharedCoordinator, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Coordinator) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&coordinator))
        .await
        .map_err(|err| StoreError::Engine(format!("blocking task failed: {err}")))?
        .map_err(ApiError::from)
}

async fn apply(
    State(coordinator): State<SharedCoordinator>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    blocking(coordinator, move |store| store.apply(&body)).await?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    key: Option<String>,
}

async fn read(
    State(coordinator): State<SharedCoordinator>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let key = match query.key {
        Some(key) if !key.is_empty() => key,
        _ => return Err(ApiError::bad_request("missing query parameter `key`")),
    };
    match coordinator.read(&key) {
        Some(value) => Ok(Json(json!({ "data": value }))),
        None => Err(ApiError::not_found("key not found")),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberQuery {
    follower_id: Option<String>,
    follower_addr: Option<String>,
}

fn required(value: Option<String>, name: &str) -> Result<String, ApiError> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ApiError::bad_request(format!(
            "missing query parameter `{name}`"
        ))),
    }
}

async fn add_node(
    State(coordinator): State<SharedCoordinator>,
    Query(query): Query<MemberQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = required(query.follower_id, "followerId")?;
    let address = required(query.follower_addr, "followerAddr")?;
    blocking(coordinator, move |store| store.add_member(&id, &address)).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn remove_node(
    State(coordinator): State<SharedCoordinator>,
    Query(query): Query<MemberQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = required(query.follower_id, "followerId")?;
    blocking(coordinator, move |store| store.remove_member(&id)).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn status(State(coordinator): State<SharedCoordinator>) -> impl IntoResponse {
    let status = coordinator.status();
    let code = match status.consensus.failure {
        Some(_) => StatusCode::SERVICE_UNAVAILABLE,
        None => StatusCode::OK,
    };
    (code, Json(status))
}
