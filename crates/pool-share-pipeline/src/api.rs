use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use crate::coordinator::PoolCoordinator;
use crate::database::UserRef;
use crate::error::PoolError;
use crate::metrics::metrics_handler;

type ApiResult<T> = std::result::Result<T, PoolError>;

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = match &self {
            PoolError::ProtectedRecord(_) => StatusCode::FORBIDDEN,
            PoolError::Validation(_) => StatusCode::BAD_REQUEST,
            PoolError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                error!("Admin request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct NewPassword {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct NewDifficulty {
    pub difficulty: f64,
}

/// Admin and stats endpoints over the coordinator.
pub fn router(coordinator: Arc<PoolCoordinator>) -> Router {
    Router::new()
        .route("/stats", get(pool_stats))
        .route("/workers", get(worker_stats))
        .route("/workers/difficulty", delete(clear_difficulty))
        .route("/workers/{name}/difficulty", put(set_difficulty))
        .route("/users", get(list_users).post(create_user))
        .route("/users/{id}", get(get_user).delete(delete_user))
        .route("/users/{id}/password", put(set_password))
        .route("/metrics", get(metrics))
        .with_state(coordinator)
}

async fn pool_stats(State(coordinator): State<Arc<PoolCoordinator>>) -> ApiResult<impl IntoResponse> {
    let stats = coordinator.get_pool_stats().await?;
    Ok(Json(json!({
        "pool": stats,
        "queued_shares": coordinator.queue_len(),
    })))
}

async fn worker_stats(State(coordinator): State<Arc<PoolCoordinator>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.get_worker_stats().await?))
}

async fn list_users(State(coordinator): State<Arc<PoolCoordinator>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(coordinator.list_users().await?))
}

async fn create_user(
    State(coordinator): State<Arc<PoolCoordinator>>,
    Json(body): Json<NewUser>,
) -> ApiResult<impl IntoResponse> {
    let id = coordinator.create_user(&body.username, &body.password).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn get_user(
    State(coordinator): State<Arc<PoolCoordinator>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let user = UserRef::parse(&id);
    match coordinator.get_user(&user).await? {
        Some(found) => Ok(Json(found)),
        None => Err(PoolError::NotFound(format!("user {}", user))),
    }
}

async fn set_password(
    State(coordinator): State<Arc<PoolCoordinator>>,
    Path(id): Path<String>,
    Json(body): Json<NewPassword>,
) -> ApiResult<StatusCode> {
    coordinator
        .set_user_secret(&UserRef::parse(&id), &body.password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_user(
    State(coordinator): State<Arc<PoolCoordinator>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    coordinator.delete_user(&UserRef::parse(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_difficulty(
    State(coordinator): State<Arc<PoolCoordinator>>,
    Path(name): Path<String>,
    Json(body): Json<NewDifficulty>,
) -> ApiResult<StatusCode> {
    coordinator.set_worker_difficulty(&name, body.difficulty).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_difficulty(State(coordinator): State<Arc<PoolCoordinator>>) -> ApiResult<StatusCode> {
    coordinator.clear_all_worker_difficulty().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn metrics() -> Response {
    match metrics_handler() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
