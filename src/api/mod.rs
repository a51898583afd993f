//! REST control surface
//!
//! Thin HTTP layer over the control, telemetry and dispatch services.
//! Handlers translate between wire shapes and domain types; all decisions
//! live in the services.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::control::{ControlService, ScheduleUpdate};
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Error, Result};
use crate::metrics;
use crate::models::{JobStatus, Schedule, TimeWindow};
use crate::store::{QueueQuery, ScheduleStore, StoreError};
use crate::telemetry::TelemetryService;

// ============================================================================
// App State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub schedules: Arc<dyn ScheduleStore>,
    pub control: Arc<ControlService>,
    pub telemetry: Arc<TelemetryService>,
    pub dispatcher: Arc<Dispatcher>,
    pub start_time: Instant,
}

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub dispatcher_running: bool,
}

/// Wire shape of a schedule; windows as "HH:MM-HH:MM" strings
#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub step_order: u32,
    pub windows: Vec<String>,
    pub quiet_hours: Vec<String>,
    pub timezone: String,
    pub throttle_per_minute: u32,
    pub max_concurrent: u32,
    pub per_domain: HashMap<String, u32>,
    pub paused: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_interval_mins: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl From<&Schedule> for ScheduleResponse {
    fn from(s: &Schedule) -> Self {
        Self {
            id: s.id.clone(),
            campaign_id: s.campaign_id.clone(),
            name: s.name.clone(),
            step_order: s.step_order,
            windows: s.windows.iter().map(|w| w.to_string()).collect(),
            quiet_hours: s.quiet_hours.iter().map(|w| w.to_string()).collect(),
            timezone: s.timezone.clone(),
            throttle_per_minute: s.throttle_per_minute,
            max_concurrent: s.max_concurrent,
            per_domain: s.per_domain.clone(),
            paused: s.paused,
            status: s.status.to_string(),
            repeat_interval_mins: s.repeat_interval_mins,
            next_run_at: s.next_run_at,
            last_run_at: s.last_run_at,
        }
    }
}

// ============================================================================
// Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub campaign_id: String,
    pub name: String,
    #[serde(default = "default_step_order")]
    pub step_order: u32,
    #[serde(default)]
    pub windows: Vec<String>,
    #[serde(default)]
    pub quiet_hours: Vec<String>,
    pub timezone: Option<String>,
    pub throttle_per_minute: Option<u32>,
    pub max_concurrent: Option<u32>,
    #[serde(default)]
    pub per_domain: HashMap<String, u32>,
    pub repeat_interval_mins: Option<u32>,
}

fn default_step_order() -> u32 {
    1
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub windows: Option<Vec<String>>,
    pub quiet_hours: Option<Vec<String>>,
    pub timezone: Option<String>,
    pub throttle_per_minute: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub per_domain: Option<HashMap<String, u32>>,
    /// Present-and-null clears the interval; absent leaves it alone
    #[serde(default, deserialize_with = "double_option")]
    pub repeat_interval_mins: Option<Option<u32>>,
}

fn double_option<'de, D>(deserializer: D) -> std::result::Result<Option<Option<u32>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub recipients: Vec<String>,
    pub start_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SendBatchRequest {
    #[serde(default = "default_batch_limit")]
    pub limit: usize,
}

fn default_batch_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Default)]
pub struct JobsQuery {
    pub status: Option<String>,
    pub search: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

fn parse_windows(raw: &[String]) -> Result<Vec<TimeWindow>> {
    raw.iter()
        .map(|s| TimeWindow::parse(s).map_err(Error::from))
        .collect()
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/api/health", get(health_check))
        // Schedule CRUD
        .route("/api/schedules", post(create_schedule).get(list_schedules))
        .route("/api/schedules/{id}", get(get_schedule))
        .route("/api/schedules/{id}", patch(update_schedule))
        // Control endpoints
        .route("/api/schedules/{id}/activate", post(activate_schedule))
        .route("/api/schedules/{id}/pause", post(pause_schedule))
        .route("/api/schedules/{id}/resume", post(resume_schedule))
        .route("/api/schedules/{id}/cancel", post(cancel_schedule))
        .route("/api/schedules/{id}/send-batch", post(send_batch))
        // Telemetry endpoints
        .route("/api/schedules/{id}/overview", get(get_overview))
        .route("/api/schedules/{id}/jobs", get(list_jobs))
        // Prometheus exposition
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Bind and serve the API until the process is shut down.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, router).await?;
    Ok(())
}

fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        // state conflicts: the request is well-formed, the schedule's
        // current state forbids it
        Error::Config(ConfigError::ScheduleBusy { .. })
        | Error::Config(ConfigError::InvalidControl { .. }) => StatusCode::CONFLICT,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: Error) -> Response {
    (error_status(&e), Json(ErrorResponse::new(e.to_string()))).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        dispatcher_running: state.dispatcher.is_running().await,
    }))
}

async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<CreateScheduleRequest>,
) -> Response {
    let result = (|| -> Result<Schedule> {
        let mut schedule = Schedule::new(request.campaign_id, request.name, request.step_order);
        schedule.windows = parse_windows(&request.windows)?;
        schedule.quiet_hours = parse_windows(&request.quiet_hours)?;
        if let Some(tz) = request.timezone {
            schedule.timezone = tz;
        }
        if let Some(rate) = request.throttle_per_minute {
            schedule.throttle_per_minute = rate;
        }
        if let Some(max) = request.max_concurrent {
            schedule.max_concurrent = max;
        }
        schedule.per_domain = request.per_domain;
        schedule.repeat_interval_mins = request.repeat_interval_mins;
        state.control.create_schedule(schedule)
    })();

    match result {
        Ok(schedule) => (
            StatusCode::CREATED,
            Json(ApiResponse::success(ScheduleResponse::from(&schedule))),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_schedules(State(state): State<AppState>) -> Response {
    match state.schedules.list_all() {
        Ok(schedules) => {
            let body: Vec<ScheduleResponse> =
                schedules.iter().map(ScheduleResponse::from).collect();
            Json(ApiResponse::success(body)).into_response()
        }
        Err(e) => error_response(e.into()),
    }
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.schedules.get(&id) {
        Ok(Some(schedule)) => {
            Json(ApiResponse::success(ScheduleResponse::from(&schedule))).into_response()
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("Schedule not found: {id}"))),
        )
            .into_response(),
        Err(e) => error_response(e.into()),
    }
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateScheduleRequest>,
) -> Response {
    let update = match (|| -> Result<ScheduleUpdate> {
        Ok(ScheduleUpdate {
            name: request.name,
            windows: request.windows.as_deref().map(parse_windows).transpose()?,
            quiet_hours: request
                .quiet_hours
                .as_deref()
                .map(parse_windows)
                .transpose()?,
            timezone: request.timezone,
            throttle_per_minute: request.throttle_per_minute,
            max_concurrent: request.max_concurrent,
            per_domain: request.per_domain,
            repeat_interval_mins: request.repeat_interval_mins,
        })
    })() {
        Ok(update) => update,
        Err(e) => return error_response(e),
    };

    match state.control.update_schedule(&id, update) {
        Ok(schedule) => {
            Json(ApiResponse::success(ScheduleResponse::from(&schedule))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn activate_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ActivateRequest>,
) -> Response {
    match state
        .control
        .activate(&id, &request.recipients, request.start_at)
    {
        Ok(report) => Json(ApiResponse::success(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn pause_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.control.pause(&id) {
        Ok(schedule) => {
            Json(ApiResponse::success(ScheduleResponse::from(&schedule))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn resume_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.control.resume(&id) {
        Ok(schedule) => {
            Json(ApiResponse::success(ScheduleResponse::from(&schedule))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn cancel_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.control.cancel(&id) {
        Ok(schedule) => {
            Json(ApiResponse::success(ScheduleResponse::from(&schedule))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn send_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<SendBatchRequest>,
) -> Response {
    match state.dispatcher.send_next_batch(&id, request.limit).await {
        Ok(report) => Json(ApiResponse::success(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_overview(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.telemetry.overview(&id) {
        Ok(overview) => Json(ApiResponse::success(overview)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(JobStatus::from_str).transpose() {
        Ok(status) => status,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(e.to_string())))
                .into_response();
        }
    };

    let queue_query = QueueQuery {
        status,
        search: query.search,
        cursor: query.cursor,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
    };

    match state.telemetry.jobs(&id, &queue_query) {
        Ok(page) => Json(ApiResponse::success(page)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_metrics() -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather(),
    )
        .into_response()
}
