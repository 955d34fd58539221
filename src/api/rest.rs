//! REST API Handlers
//!
//! Operator and drive-daemon facing endpoints: request admission and
//! queue views, drive registration and unit status reports, the
//! confirm/reset pair protocol, volume queries and priority overrides.

use super::peer::PeerResolver;
use crate::domain::types::{
    AccessMode, ClientIdentity, DriveId, Lifespan, MountRequest, RequestId,
};
use crate::error::{Error, ErrorKind};
use crate::queue::{NewMountRequest, QueueFilter};
use crate::registry::{DriveReport, DriveStatus, DriveView, NewDrive};
use crate::scheduler::Vdqm;
use axum::{
    extract::{ConnectInfo, Json, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// `?deviceGroup=&server=` listing filter
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingQuery {
    #[serde(default)]
    pub device_group: Option<String>,
    #[serde(default)]
    pub server: Option<String>,
}

/// `?lifespan=` priority filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriorityQuery {
    #[serde(default)]
    pub lifespan: Option<Lifespan>,
}

/// Queue position of one request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub request_id: RequestId,
    /// 1-based, -1 when not queued
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedicationRequest {
    pub dedication: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeRequest {
    pub status: DriveStatus,
}

/// Unit status report as posted by a drive daemon. The reporting host is
/// taken from the connection, not the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report: DriveReport,
}

/// Pair handed out for submission
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResponse {
    pub drive: DriveView,
    pub request: MountRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeQueryResponse {
    pub vid: String,
    pub in_use: Option<bool>,
    pub mounted: Option<bool>,
}

/// Create or replace a volume priority override
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPriorityRequest {
    pub vid: String,
    pub mode: AccessMode,
    pub lifespan: Lifespan,
    pub priority: i32,
    pub client: ClientIdentity,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    vdqm: Arc<Vdqm>,
}

impl RestRouter {
    pub fn new(vdqm: Arc<Vdqm>) -> Self {
        Self { vdqm }
    }

    /// Build the Axum router. Serve it with connect info so drive reports
    /// can be attributed to their peer.
    pub fn build(self) -> Router {
        let peers = Arc::new(PeerResolver::new(&self.vdqm.config().server_addresses));
        let state = AppState {
            vdqm: self.vdqm,
            peers,
        };

        Router::new()
            // Request queue
            .route("/v1/requests", post(submit_request).get(list_requests))
            .route("/v1/requests/:id", get(get_request).delete(cancel_request))
            .route("/v1/requests/:id/position", get(request_position))
            // Drives
            .route("/v1/drives", get(list_drives).post(register_drive))
            .route("/v1/drives/:id", get(get_drive).delete(delete_drive))
            .route("/v1/drives/:id/dedication", put(dedicate_drive))
            .route("/v1/drives/:id/status", post(set_drive_status))
            .route("/v1/drives/:id/report", post(drive_report))
            // Pair protocol
            .route("/v1/drives/:id/confirm/:request", post(confirm_pair))
            .route("/v1/drives/:id/reset/:request", post(reset_pair))
            .route("/v1/submissions/next", post(next_submission))
            // Volumes
            .route("/v1/volumes/:vid/in-use", get(volume_in_use))
            .route("/v1/volumes/:vid/mounted", get(volume_mounted))
            // Priorities
            .route("/v1/priorities", get(list_priorities).put(set_priority))
            .route("/v1/priorities/effective", get(effective_priorities))
            .route("/v1/priorities/:vid/:mode/:lifespan", delete(delete_priority))
            // Maintenance
            .route("/v1/liveness/sweep", post(liveness_sweep))
            .route("/v1/status", get(status))
            // Health / metrics
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    vdqm: Arc<Vdqm>,
    peers: Arc<PeerResolver>,
}

// =============================================================================
// Error Mapping
// =============================================================================

fn status_for(e: &Error) -> StatusCode {
    match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ResourceBusy | ErrorKind::Contended => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument if matches!(e, Error::DuplicateRequest { .. }) => {
            StatusCode::CONFLICT
        }
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(e: &Error) -> &'static str {
    match e {
        Error::NotFound { .. } => "not_found",
        Error::Contended { .. } => "contended",
        Error::ResourceBusy { .. } => "resource_busy",
        Error::DuplicateRequest { .. } => "duplicate_request",
        Error::IllegalTransition { .. } => "illegal_transition",
        Error::InvalidArgument(_) => "invalid_argument",
        _ => "internal_error",
    }
}

fn error_response(e: Error) -> Response {
    let status = status_for(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {}", e);
    } else {
        debug!("Request rejected: {}", e);
    }
    (
        status,
        Json(ApiErrorResponse {
            error: error_code(&e).into(),
            message: e.to_string(),
            details: None,
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(status: StatusCode, result: crate::error::Result<T>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Request Handlers
// =============================================================================

/// Admit a mount request
async fn submit_request(
    State(state): State<AppState>,
    Json(request): Json<NewMountRequest>,
) -> Response {
    debug!(vid = %request.vid, mode = %request.access_mode, "mount request received");
    respond(StatusCode::CREATED, state.vdqm.submit_request(request).await)
}

/// Priority-ordered queue listing
async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListingQuery>,
) -> Response {
    let filter = QueueFilter::new(query.device_group, query.server);
    respond(StatusCode::OK, state.vdqm.queue_listing(&filter).await)
}

async fn get_request(State(state): State<AppState>, Path(id): Path<RequestId>) -> Response {
    respond(StatusCode::OK, state.vdqm.request(id).await)
}

async fn request_position(State(state): State<AppState>, Path(id): Path<RequestId>) -> Response {
    let result = state
        .vdqm
        .queue_position(id)
        .await
        .map(|position| PositionResponse {
            request_id: id,
            position,
        });
    respond(StatusCode::OK, result)
}

/// Cancel a request, resetting its drive if it was bound
async fn cancel_request(State(state): State<AppState>, Path(id): Path<RequestId>) -> Response {
    info!("Cancelling request {}", id);
    respond(StatusCode::OK, state.vdqm.cancel_request(id).await)
}

// =============================================================================
// Drive Handlers
// =============================================================================

async fn list_drives(State(state): State<AppState>, Query(query): Query<ListingQuery>) -> Response {
    let result = state
        .vdqm
        .drive_listing(query.device_group.as_deref(), query.server.as_deref())
        .await;
    respond(StatusCode::OK, result)
}

async fn register_drive(State(state): State<AppState>, Json(drive): Json<NewDrive>) -> Response {
    info!("Registering drive {}@{}", drive.name, drive.server);
    let result = state.vdqm.register_drive(drive).await.map(DriveView::from);
    respond(StatusCode::CREATED, result)
}

async fn get_drive(State(state): State<AppState>, Path(id): Path<DriveId>) -> Response {
    respond(StatusCode::OK, state.vdqm.drive(id).await.map(DriveView::from))
}

async fn delete_drive(State(state): State<AppState>, Path(id): Path<DriveId>) -> Response {
    info!("Deleting drive {}", id);
    respond(StatusCode::OK, state.vdqm.delete_drive(id).await.map(DriveView::from))
}

async fn dedicate_drive(
    State(state): State<AppState>,
    Path(id): Path<DriveId>,
    Json(body): Json<DedicationRequest>,
) -> Response {
    info!("Dedicating drive {}: {}", id, body.dedication);
    let result = state
        .vdqm
        .dedicate_drive(id, &body.dedication)
        .await
        .map(DriveView::from);
    respond(StatusCode::OK, result)
}

/// Administrative status change
async fn set_drive_status(
    State(state): State<AppState>,
    Path(id): Path<DriveId>,
    Json(body): Json<StatusChangeRequest>,
) -> Response {
    info!("Setting drive {} {}", id, body.status);
    let result = state
        .vdqm
        .set_drive_status(id, body.status)
        .await
        .map(DriveView::from);
    respond(StatusCode::OK, result)
}

/// Unit status report from a drive daemon
async fn drive_report(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(id): Path<DriveId>,
    Json(body): Json<ReportRequest>,
) -> Response {
    let host = state.peers.host_of(&state.vdqm, peer.ip()).await;
    debug!(drive = %id, peer = %peer, host = %host, report = %body.report, "drive report");
    let result = state
        .vdqm
        .report(id, body.report, &host)
        .await
        .map(DriveView::from);
    respond(StatusCode::OK, result)
}

// =============================================================================
// Pair Protocol Handlers
// =============================================================================

async fn confirm_pair(
    State(state): State<AppState>,
    Path((drive, request)): Path<(DriveId, RequestId)>,
) -> Response {
    respond(StatusCode::OK, state.vdqm.confirm(drive, request).await)
}

async fn reset_pair(
    State(state): State<AppState>,
    Path((drive, request)): Path<(DriveId, RequestId)>,
) -> Response {
    respond(StatusCode::OK, state.vdqm.reset_pair(drive, request).await)
}

/// Claim the oldest allocated pair; 204 when there is none
async fn next_submission(State(state): State<AppState>) -> Response {
    match state.vdqm.next_to_submit().await {
        Ok(Some((drive, request))) => (
            StatusCode::OK,
            Json(SubmissionResponse {
                drive: drive.into(),
                request,
            }),
        )
            .into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn volume_in_use(State(state): State<AppState>, Path(vid): Path<String>) -> Response {
    let result = state.vdqm.volume_in_use(&vid).await.map(|in_use| VolumeQueryResponse {
        vid: vid.clone(),
        in_use: Some(in_use),
        mounted: None,
    });
    respond(StatusCode::OK, result)
}

async fn volume_mounted(State(state): State<AppState>, Path(vid): Path<String>) -> Response {
    let result = state.vdqm.volume_mounted(&vid).await.map(|mounted| VolumeQueryResponse {
        vid: vid.clone(),
        in_use: None,
        mounted: Some(mounted),
    });
    respond(StatusCode::OK, result)
}

// =============================================================================
// Priority Handlers
// =============================================================================

async fn list_priorities(
    State(state): State<AppState>,
    Query(query): Query<PriorityQuery>,
) -> Response {
    respond(StatusCode::OK, state.vdqm.priorities(query.lifespan).await)
}

async fn effective_priorities(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.vdqm.effective_priorities().await)
}

/// Create or replace an override; returns the one it replaced, if any
async fn set_priority(
    State(state): State<AppState>,
    Json(body): Json<SetPriorityRequest>,
) -> Response {
    let result = state
        .vdqm
        .set_priority(&body.vid, body.mode, body.lifespan, body.priority, body.client)
        .await
        .map(|previous| serde_json::json!({ "previous": previous }));
    respond(StatusCode::OK, result)
}

async fn delete_priority(
    State(state): State<AppState>,
    Path((vid, mode, lifespan)): Path<(String, String, String)>,
) -> Response {
    let parsed = mode
        .parse::<AccessMode>()
        .and_then(|mode| lifespan.parse::<Lifespan>().map(|lifespan| (mode, lifespan)));
    let (mode, lifespan) = match parsed {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };
    respond(
        StatusCode::OK,
        state.vdqm.delete_priority(&vid, mode, lifespan).await,
    )
}

// =============================================================================
// Maintenance / Health
// =============================================================================

async fn liveness_sweep(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.vdqm.sweep().await)
}

async fn status(State(state): State<AppState>) -> Response {
    respond(StatusCode::OK, state.vdqm.status().await)
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "healthy"})))
}

/// Ready once the scheduler is running
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.vdqm.is_running() {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "starting"})),
        )
    }
}

/// Prometheus text exposition
async fn metrics(State(state): State<AppState>) -> Response {
    let encoded = match state.vdqm.refresh_metrics().await {
        Ok(()) => state.vdqm.metrics().encode(),
        Err(e) => Err(e),
    };
    match encoded {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}
