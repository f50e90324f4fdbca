use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use ferry_core::{
    Artifact, ArtifactName, ArtifactRegistry, SessionView, Supervisor, TransferCoordinator,
    TransferError, TransferParams, TransferRequest,
};

use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, RequestMetrics};

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub transfers: Arc<TransferCoordinator>,
    pub artifacts: Arc<ArtifactRegistry>,
    pub metrics: Arc<RequestMetrics>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Local>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let supervisor = Arc::new(Supervisor::new(config.supervisor()));
        let transfers = Arc::new(TransferCoordinator::new(supervisor.clone(), config.transfer()));
        let artifacts = Arc::new(ArtifactRegistry::new(config.data_dir.clone()));
        Self {
            supervisor,
            transfers,
            artifacts,
            metrics: Arc::new(RequestMetrics::default()),
            config: Arc::new(config),
            started_at: Local::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/server/start", post(start_server))
        .route("/api/server/stop", post(stop_server))
        .route("/api/server/status", get(server_status))
        .route("/api/server/logs", get(server_logs))
        .route("/api/transfer/send", post(send_file))
        .route("/api/files/list", get(list_files))
        .route("/api/files/download/{name}", get(download_file))
        .route("/api/files/delete/{name}", delete(delete_file))
        .route("/api/files/cleanup", post(cleanup_empty_files))
        .route("/health", get(health))
        .route("/health/detailed", get(detailed_health));

    let api = match &state.config.ui_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api.fallback(not_found),
    };

    api.layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(middleware::from_fn_with_state(state.metrics.clone(), metrics::track))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Request/response types ──────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub port: Option<u16>,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub success: bool,
    pub port: u16,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub logs: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub success: bool,
    pub message: String,
    /// Seconds.
    pub duration: f64,
    pub duration_ms: u64,
    /// KB/s.
    pub speed: f64,
    pub file_size: u64,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub success: bool,
    pub files: Vec<Artifact>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub success: bool,
    pub removed: usize,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Local>,
    pub uptime_seconds: f64,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub server_status: SessionView,
}

#[derive(Debug, Serialize)]
pub struct BuildArtifacts {
    pub server_exe_exists: bool,
    pub client_exe_exists: bool,
    pub build_dir_exists: bool,
}

#[derive(Debug, Serialize)]
pub struct ArtifactsDir {
    pub path: PathBuf,
    pub exists: bool,
    pub file_count: usize,
    /// Version of the `<base>_<timestamp>_<source>` naming scheme used for base names.
    pub naming_contract: u32,
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    #[serde(flatten)]
    pub health: HealthResponse,
    pub build_artifacts: BuildArtifacts,
    pub artifacts_dir: ArtifactsDir,
}

// ── Receiver lifecycle ──────────────────────────────────────────────────

/// POST /api/server/start — start (or restart) the receiver.
pub async fn start_server(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<StartResponse>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let requested = req.port.unwrap_or(state.config.receiver_port);
    let output_dir = req.output_dir.unwrap_or_else(|| state.config.data_dir.clone());

    let port = state.supervisor.start(requested, &output_dir).await?;
    let message = if port != requested {
        format!("Server started on port {} (original port {} was in use)", port, requested)
    } else {
        format!("Server started on port {}", port)
    };
    Ok(Json(StartResponse {
        success: true,
        port,
        message,
    }))
}

/// POST /api/server/stop — stop the receiver; succeeds when none is running.
pub async fn stop_server(State(state): State<AppState>) -> Json<MessageResponse> {
    if state.supervisor.stop().await {
        MessageResponse::ok("Server stopped successfully")
    } else {
        MessageResponse::ok("Server is not running")
    }
}

/// GET /api/server/status
pub async fn server_status(State(state): State<AppState>) -> Json<SessionView> {
    Json(state.supervisor.status())
}

/// GET /api/server/logs — last receiver output lines, oldest first.
pub async fn server_logs(State(state): State<AppState>) -> Json<LogsResponse> {
    let logs = state
        .supervisor
        .logs()
        .iter()
        .map(ToString::to_string)
        .collect();
    Json(LogsResponse { logs })
}

// ── Transfers ───────────────────────────────────────────────────────────

/// POST /api/transfer/send — multipart upload relayed through the sender.
///
/// Fields: `file` (required), `host`, `chunk_size`, `window_size`, `timeout`,
/// `max_retries`.
pub async fn send_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<TransferResponse>, ApiError> {
    let mut upload: Option<(String, Bytes)> = None;
    let mut form: HashMap<String, String> = HashMap::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let data = field.bytes().await?;
            upload = Some((file_name, data));
        } else {
            let value = field.text().await?;
            form.insert(name, value);
        }
    }

    let Some((file_name, payload)) = upload else {
        return Err(ApiError::bad_request("No file provided in request"));
    };
    if file_name.is_empty() {
        return Err(ApiError::bad_request("No file selected"));
    }

    let defaults = TransferParams::default();
    let params = TransferParams {
        chunk_size: form_int(&form, "chunk_size", defaults.chunk_size)?,
        window_size: form_int(&form, "window_size", defaults.window_size)?,
        timeout_ms: form_int(&form, "timeout", defaults.timeout_ms)?,
        max_retries: form_int(&form, "max_retries", defaults.max_retries)?,
    };
    let host = form
        .get("host")
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .unwrap_or("127.0.0.1")
        .to_string();

    info!(file = %file_name, bytes = payload.len(), %host, "Transfer requested");
    let report = state
        .transfers
        .transfer(TransferRequest {
            host,
            file_name,
            payload,
            params,
        })
        .await?;

    Ok(Json(TransferResponse {
        success: true,
        message: "File transferred successfully".into(),
        duration: report.duration.as_secs_f64(),
        duration_ms: report.duration_ms(),
        speed: report.throughput_kbs(),
        file_size: report.byte_count,
    }))
}

// ── Artifacts ───────────────────────────────────────────────────────────

/// GET /api/files/list — received files, newest first.
pub async fn list_files(State(state): State<AppState>) -> Result<Json<FilesResponse>, ApiError> {
    let files = state.artifacts.list().await?;
    Ok(Json(FilesResponse {
        success: true,
        files,
    }))
}

/// GET /api/files/download/{name} — stream a file, addressed by stored or base name.
pub async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let (artifact, file) = state.artifacts.open(&name).await?;
    let length = file
        .metadata()
        .await
        .map(|m| m.len())
        .unwrap_or(artifact.size_bytes);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    let disposition = format!("attachment; filename=\"{}\"", name.replace('"', "_"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    info!(requested = %name, stored = %artifact.stored_name, bytes = length, "Serving artifact");
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body))
}

/// DELETE /api/files/delete/{name}
pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.artifacts.delete(&name).await?;
    Ok(MessageResponse::ok("File deleted successfully"))
}

/// POST /api/files/cleanup — remove zero-byte files.
pub async fn cleanup_empty_files(
    State(state): State<AppState>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let removed = state.artifacts.purge_empty().await?;
    Ok(Json(CleanupResponse {
        success: true,
        removed,
        message: format!("Cleanup completed. Removed {} empty files.", removed),
    }))
}

// ── Health ──────────────────────────────────────────────────────────────

/// GET /health — liveness plus request counters and receiver status.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health_snapshot(&state))
}

/// GET /health/detailed — adds executable and artifacts-directory checks.
pub async fn detailed_health(State(state): State<AppState>) -> Json<DetailedHealthResponse> {
    let config = &state.config;
    let build_artifacts = BuildArtifacts {
        server_exe_exists: tokio::fs::metadata(&config.receiver_bin).await.is_ok(),
        client_exe_exists: tokio::fs::metadata(&config.sender_bin).await.is_ok(),
        build_dir_exists: tokio::fs::metadata(&config.bin_dir).await.is_ok(),
    };

    let exists = tokio::fs::metadata(state.artifacts.dir()).await.is_ok();
    let file_count = if exists {
        state.artifacts.list().await.map(|files| files.len()).unwrap_or(0)
    } else {
        0
    };

    Json(DetailedHealthResponse {
        health: health_snapshot(&state),
        build_artifacts,
        artifacts_dir: ArtifactsDir {
            path: state.artifacts.dir().to_path_buf(),
            exists,
            file_count,
            naming_contract: ArtifactName::CONTRACT_VERSION,
        },
    })
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Endpoint not found" })),
    )
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn health_snapshot(state: &AppState) -> HealthResponse {
    let uptime = Local::now() - state.started_at;
    HealthResponse {
        status: "healthy",
        timestamp: Local::now(),
        uptime_seconds: uptime.num_milliseconds() as f64 / 1000.0,
        request_count: state.metrics.request_count(),
        error_count: state.metrics.error_count(),
        error_rate: state.metrics.error_rate(),
        server_status: state.supervisor.status(),
    }
}

/// Integer form field, or `default` when absent or blank.
fn form_int(form: &HashMap<String, String>, field: &'static str, default: i64) -> Result<i64, TransferError> {
    match form.get(field).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse().map_err(|_| TransferError::Malformed { field }),
    }
}
