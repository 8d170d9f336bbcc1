// HTTP API for configuration and manual overrides

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use orbitgate_core::{
    BrainConfig, DetectorConfig, Error, ObjectStatus, QualityThresholds, ThresholdUpdate,
    TrackerConfig,
};
use orbitgate_eye::ObjectBrain;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Default and maximum history rows per request
const DEFAULT_HISTORY_LIMIT: usize = 50;
// SECURITY: cap history reads
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub brain: Arc<ObjectBrain>,
    pub detector: Arc<DetectorConfig>,
}

impl ApiState {
    pub fn new(brain: Arc<ObjectBrain>, detector: DetectorConfig) -> Self {
        Self {
            brain,
            detector: Arc::new(detector),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Error mapped onto an HTTP status
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("object {} not found", id),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Configuration(msg) => Self::bad_request(msg),
            other => {
                error!("Request failed: {}", other);
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: other.to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    store: bool,
    durable: bool,
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    brain: BrainConfig,
    tracker: TrackerConfig,
    detector: DetectorConfig,
}

#[derive(Debug, Deserialize)]
struct ConfigRequest {
    brain: Option<BrainConfig>,
    tracker: Option<TrackerConfig>,
}

#[derive(Debug, Deserialize)]
struct ClassThresholdsRequest {
    class: String,
    thresholds: QualityThresholds,
}

#[derive(Debug, Default, Deserialize)]
struct OverrideRequest {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Create HTTP router with all API routes
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/objects", get(list_objects_handler))
        .route("/objects/config", get(get_config_handler).post(set_config_handler))
        .route("/objects/config/thresholds", post(set_thresholds_handler))
        .route(
            "/objects/config/per-class-thresholds",
            post(set_class_thresholds_handler),
        )
        .route("/objects/:id", get(get_object_handler))
        .route("/objects/:id/quality", get(quality_handler))
        .route("/objects/:id/admit", post(admit_handler))
        .route("/objects/:id/quarantine", post(quarantine_handler))
        .route("/objects/:id/history", get(history_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let store = state.brain.store().ping().await;
    let durable = state
        .brain
        .persistence()
        .map(|p| p.is_connected())
        .unwrap_or(false);
    let status = if store { "ok" } else { "degraded" };
    Json(HealthResponse {
        status,
        store,
        durable,
    })
}

fn config_response(state: &ApiState) -> ConfigResponse {
    ConfigResponse {
        brain: state.brain.config(),
        tracker: state.brain.tracker().config(),
        detector: (*state.detector).clone(),
    }
}

async fn get_config_handler(State(state): State<ApiState>) -> Json<ConfigResponse> {
    Json(config_response(&state))
}

async fn set_config_handler(
    State(state): State<ApiState>,
    Json(request): Json<ConfigRequest>,
) -> ApiResult<ConfigResponse> {
    // Validate both before applying either
    if let Some(brain) = &request.brain {
        brain.validate()?;
    }
    if let Some(tracker) = &request.tracker {
        tracker.validate()?;
    }
    if let Some(brain) = request.brain {
        state.brain.update_config(brain)?;
    }
    if let Some(tracker) = request.tracker {
        state.brain.tracker().update_config(tracker)?;
        info!("Tracker configuration replaced");
    }
    Ok(Json(config_response(&state)))
}

async fn set_thresholds_handler(
    State(state): State<ApiState>,
    Json(update): Json<ThresholdUpdate>,
) -> ApiResult<QualityThresholds> {
    Ok(Json(state.brain.update_thresholds(&update)?))
}

async fn set_class_thresholds_handler(
    State(state): State<ApiState>,
    Json(request): Json<ClassThresholdsRequest>,
) -> ApiResult<ConfigResponse> {
    if request.class.trim().is_empty() {
        return Err(ApiError::bad_request("class must not be empty"));
    }
    state
        .brain
        .set_class_thresholds(&request.class, request.thresholds)?;
    Ok(Json(config_response(&state)))
}

async fn list_objects_handler(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<ObjectStatus>().map_err(ApiError::bad_request)?),
    };
    let objects = state.brain.list_objects(status).await?;
    Ok(Json(serde_json::json!({
        "count": objects.len(),
        "objects": objects,
    })))
}

async fn get_object_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.brain.get_object_status(&id).await? {
        Some(view) => Ok(Json(view).into_response()),
        None => Err(ApiError::not_found(&id)),
    }
}

async fn quality_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    match state.brain.check_quality_thresholds(&id).await? {
        Some(report) => Ok(Json(report).into_response()),
        None => Err(ApiError::not_found(&id)),
    }
}

fn override_reason(body: Option<Json<OverrideRequest>>, default: &str) -> String {
    body.and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

async fn admit_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<OverrideRequest>>,
) -> Result<Response, ApiError> {
    if !state.brain.store().exists(&id).await? {
        return Err(ApiError::not_found(&id));
    }
    let reason = override_reason(body, "operator admit");
    let outcome = state.brain.force_admit(&id, &reason).await?;
    Ok(Json(outcome).into_response())
}

async fn quarantine_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<OverrideRequest>>,
) -> Result<Response, ApiError> {
    if !state.brain.store().exists(&id).await? {
        return Err(ApiError::not_found(&id));
    }
    let reason = override_reason(body, "operator quarantine");
    let outcome = state.brain.force_quarantine(&id, &reason).await?;
    Ok(Json(outcome).into_response())
}

async fn history_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let history = state.brain.get_object_history(&id, limit).await?;
    Ok(Json(serde_json::json!({
        "obj_id": id,
        "metrics": history,
    }))
    .into_response())
}
