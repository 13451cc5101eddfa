//! HTTP API for the dashboard.
//!
//! Users, tasks, and the avatar ledger. All `/api/*` routes require a bearer
//! token when `api.api_key` is set.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use pos_core::config::ApiConfig;
use pos_core::error::PosError;
use pos_core::ledger::LedgerError;
use pos_memory::{NewTask, NewUser, TaskStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::avatars::AvatarService;

type ApiError = (StatusCode, Json<Value>);

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    service: Arc<AvatarService>,
    api_key: Option<String>,
    uptime: Instant,
    /// Timezone for users created without one.
    default_timezone: String,
}

impl ApiState {
    pub fn new(
        service: Arc<AvatarService>,
        config: &ApiConfig,
        default_timezone: impl Into<String>,
    ) -> Self {
        let api_key = if config.api_key.is_empty() {
            None
        } else {
            Some(config.api_key.clone())
        };
        Self {
            service,
            api_key,
            uptime: Instant::now(),
            default_timezone: default_timezone.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AwardRequest {
    avatar: String,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct TaskFilter {
    status: Option<String>,
}

/// Constant-time string comparison to prevent timing attacks on API token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check bearer token auth.
fn check_auth(headers: &HeaderMap, api_key: &Option<String>) -> Result<(), ApiError> {
    let Some(key) = api_key else {
        return Ok(());
    };

    let unauthorized = |msg: &str| (StatusCode::UNAUTHORIZED, Json(json!({"error": msg})));

    let value = headers
        .get("authorization")
        .ok_or_else(|| unauthorized("missing Authorization header"))?
        .to_str()
        .map_err(|_| unauthorized("invalid Authorization header"))?;

    match value.strip_prefix("Bearer ") {
        Some(token) if constant_time_eq(token, key) => Ok(()),
        _ => Err(unauthorized("invalid token")),
    }
}

/// Map a service error onto a status code and JSON body.
fn api_error(e: PosError) -> ApiError {
    let status = match &e {
        PosError::Ledger(LedgerError::InvalidAmount(_) | LedgerError::InvalidName(_))
        | PosError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PosError::NotFound(_) => StatusCode::NOT_FOUND,
        PosError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {e}");
    }
    (status, Json(json!({"error": e.to_string()})))
}

fn bad_body(e: JsonRejection) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": format!("invalid request: {e}")})),
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| api_error(e.into()))
}

/// `GET /`: Service banner.
async fn root() -> Json<Value> {
    Json(json!({
        "message": "POS System API",
        "status": "online",
        "health": "/health",
    }))
}

/// `GET /health`: Liveness with uptime.
async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "POS API",
        "uptime_secs": state.uptime.elapsed().as_secs(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `POST /api/users`
async fn create_user(
    headers: HeaderMap,
    State(state): State<ApiState>,
    body: Result<Json<NewUser>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check_auth(&headers, &state.api_key)?;
    let Json(new) = body.map_err(bad_body)?;

    let user = state
        .service
        .store()
        .create_user(&new, &state.default_timezone)
        .await
        .map_err(api_error)?;
    info!("api: created user {}", user.id);
    Ok((StatusCode::CREATED, Json(to_json(&user)?)))
}

/// `GET /api/users/{id}`
async fn get_user(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&headers, &state.api_key)?;
    let user = state.service.store().get_user(&id).await.map_err(api_error)?;
    Ok(Json(to_json(&user)?))
}

/// `GET /api/users/{id}/avatars`: Totals, balance, and each avatar's level progress.
async fn avatars(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&headers, &state.api_key)?;
    let overview = state.service.overview(&id).await.map_err(api_error)?;
    Ok(Json(to_json(&overview)?))
}

/// `POST /api/users/{id}/avatars/xp`
async fn award_xp(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Result<Json<AwardRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&headers, &state.api_key)?;
    let Json(req) = body.map_err(bad_body)?;

    let award = state
        .service
        .award(&id, &req.avatar, req.amount)
        .await
        .map_err(api_error)?;
    Ok(Json(to_json(&award)?))
}

/// `POST /api/tasks`
async fn create_task(
    headers: HeaderMap,
    State(state): State<ApiState>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check_auth(&headers, &state.api_key)?;
    let Json(new) = body.map_err(bad_body)?;

    let task = state
        .service
        .store()
        .create_task(&new)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(to_json(&task)?)))
}

/// `GET /api/users/{id}/tasks?status=pending`
async fn list_tasks(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(filter): Query<TaskFilter>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&headers, &state.api_key)?;
    let status = filter
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(api_error)?;

    let store = state.service.store();
    store.get_user(&id).await.map_err(api_error)?;
    let tasks = store.list_tasks(&id, status).await.map_err(api_error)?;
    Ok(Json(json!({
        "user_id": id,
        "count": tasks.len(),
        "tasks": to_json(&tasks)?,
    })))
}

/// `POST /api/tasks/{id}/complete`
async fn complete_task(
    headers: HeaderMap,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_auth(&headers, &state.api_key)?;
    let completion = state.service.complete_task(&id).await.map_err(api_error)?;
    Ok(Json(to_json(&completion)?))
}

/// Build the axum router with shared state.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/users", post(create_user))
        .route("/api/users/{id}", get(get_user))
        .route("/api/users/{id}/avatars", get(avatars))
        .route("/api/users/{id}/avatars/xp", post(award_xp))
        .route("/api/users/{id}/tasks", get(list_tasks))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024)) // 1 MB max request body
        .with_state(state)
}

/// Bind and run the API server until it fails.
pub async fn serve(config: &ApiConfig, state: ApiState) -> Result<(), PosError> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!("API server failed to bind to {addr}: {e}");
        PosError::Io(e)
    })?;

    info!("API server listening on {addr}");

    axum::serve(listener, app).await.map_err(|e| {
        error!("API server error: {e}");
        PosError::Io(e)
    })
}
