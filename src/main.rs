use std::{
    collections::{HashMap, hash_map::Entry},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{
    net::TcpListener,
    process::Command,
    sync::Mutex,
    time::{Duration, timeout},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
struct AppState {
    records: Arc<Mutex<RecordStore>>,
    api_key: String,
    temp_dir: PathBuf,
    yt_dlp_version: Option<String>,
}

const SERVICE_NAME: &str = "YouTube Shorts Automation API";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const RECORD_TTL_SECONDS: i64 = 3600;
const CLEANUP_AFTER_LABEL: &str = "1 hour";
const DESCRIPTION_MAX_CHARS: usize = 500;
const YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const FORMAT_SELECTOR: &str = "best[ext=mp4]/best";
const VIDEO_EXTENSIONS: [&str; 3] = ["mp4", "webm", "mkv"];
const PUBLIC_URL_TIP: &str = "Check that the URL is valid and the video is publicly available";

#[derive(Debug, Clone, Serialize)]
struct VideoMetadata {
    title: String,
    duration: u64,
    channel: String,
    upload_date: String,
    view_count: u64,
    like_count: u64,
    description: String,
    thumbnail: String,
}

#[derive(Debug, Clone)]
struct DownloadRecord {
    id: Uuid,
    file_path: PathBuf,
    metadata: VideoMetadata,
    downloaded_at: DateTime<Utc>,
    file_size_bytes: u64,
}

#[derive(Debug, Default)]
struct RecordStore {
    records: HashMap<Uuid, DownloadRecord>,
}

#[derive(Debug, PartialEq, Eq)]
struct DuplicateId(Uuid);

impl RecordStore {
    fn insert(&mut self, record: DownloadRecord) -> Result<(), DuplicateId> {
        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(DuplicateId(record.id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    fn list(&self) -> Vec<&DownloadRecord> {
        let mut records: Vec<_> = self.records.values().collect();
        records.sort_by_key(|record| record.downloaded_at);
        records
    }

    /// Removes every record older than `ttl` and hands the evicted records
    /// back to the caller, which owns deleting their backing files.
    fn sweep_expired(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) -> Vec<DownloadRecord> {
        let expired: Vec<Uuid> = self
            .records
            .values()
            .filter(|record| now - record.downloaded_at > ttl)
            .map(|record| record.id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .collect()
    }

    fn count(&self) -> usize {
        self.records.len()
    }

    fn total_size_bytes(&self) -> u64 {
        self.records
            .values()
            .map(|record| record.file_size_bytes)
            .sum()
    }
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    video_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct VideoInfoPayload {
    #[serde(flatten)]
    metadata: VideoMetadata,
    video_id: Uuid,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    success: bool,
    video_id: Uuid,
    video_info: VideoInfoPayload,
    file_size_mb: f64,
    message: String,
}

#[derive(Debug, Serialize)]
struct VideoSummary {
    video_id: Uuid,
    title: String,
    duration: u64,
    size_mb: f64,
    downloaded_at: DateTime<Utc>,
}

impl VideoSummary {
    fn from_record(record: &DownloadRecord) -> Self {
        Self {
            video_id: record.id,
            title: record.metadata.title.clone(),
            duration: record.metadata.duration,
            size_mb: bytes_to_mb(record.file_size_bytes),
            downloaded_at: record.downloaded_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ServerInfo {
    temp_dir: String,
    cleanup_after: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    yt_dlp_version: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
    videos_count: usize,
    total_size_mb: f64,
    videos: Vec<VideoSummary>,
    server_info: ServerInfo,
}

#[derive(Debug, Serialize)]
struct TestResponse {
    success: bool,
    message: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tips: Option<&'static str>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
    tips: Option<&'static str>,
}

impl ApiError {
    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "Invalid or missing API key".to_string(),
            details: None,
            tips: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
            tips: None,
        }
    }

    fn extraction(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Extraction failed".to_string(),
            details: Some(details.into()),
            tips: Some(PUBLIC_URL_TIP),
        }
    }

    fn download_failed(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Download failed".to_string(),
            details: Some(details.into()),
            tips: Some(PUBLIC_URL_TIP),
        }
    }

    fn no_output_file() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Download failed".to_string(),
            details: Some(format!(
                "no output file with a supported extension ({}) was produced",
                VIDEO_EXTENSIONS.join(", ")
            )),
            tips: None,
        }
    }

    fn internal(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Server error".to_string(),
            details: Some(details.into()),
            tips: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(
                "{}: {}",
                self.message,
                self.details.as_deref().unwrap_or("no details")
            );
        }

        let body = Json(ErrorBody {
            error: self.message,
            details: self.details,
            tips: self.tips,
        });

        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct YtDlpProbe {
    title: Option<String>,
    duration: Option<f64>,
    channel: Option<String>,
    upload_date: Option<String>,
    view_count: Option<u64>,
    like_count: Option<u64>,
    description: Option<String>,
    thumbnail: Option<String>,
}

impl VideoMetadata {
    fn from_probe(probe: YtDlpProbe) -> Self {
        Self {
            title: probe
                .title
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| "Untitled".to_string()),
            duration: probe
                .duration
                .map(|seconds| seconds.max(0.0).round() as u64)
                .unwrap_or(0),
            channel: probe
                .channel
                .and_then(|value| non_empty(&value).map(ToString::to_string))
                .unwrap_or_else(|| "Unknown".to_string()),
            upload_date: probe.upload_date.unwrap_or_default(),
            view_count: probe.view_count.unwrap_or(0),
            like_count: probe.like_count.unwrap_or(0),
            description: truncate_description(&probe.description.unwrap_or_default()),
            thumbnail: probe.thumbnail.unwrap_or_default(),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "shorts_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        let cause = error.details.unwrap_or(error.message);
        eprintln!("Server error: {cause}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let api_key = std::env::var("API_KEY")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
        .ok_or_else(|| {
            ApiError::internal(
                "API_KEY is not set. Configure a shared secret before starting the server.",
            )
        })?;

    let temp_dir = std::env::var("TEMP_DIR")
        .ok()
        .and_then(|value| non_empty(&value).map(PathBuf::from))
        .unwrap_or_else(std::env::temp_dir);
    tokio::fs::create_dir_all(&temp_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("could not create temp dir {temp_dir:?}: {error}"))
        })?;

    let yt_dlp_version = probe_yt_dlp_version().await;
    match &yt_dlp_version {
        Some(version) => info!("yt-dlp {version} detected"),
        None => warn!("yt-dlp not found on PATH; downloads will fail until it is installed"),
    }

    if let Some(base_url) = std::env::var("BASE_URL")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        info!("public base URL: {base_url}");
    }
    info!("temp dir: {}", temp_dir.display());

    let state = AppState {
        records: Arc::new(Mutex::new(RecordStore::default())),
        api_key,
        temp_dir,
        yt_dlp_version,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(handle_home))
        .route("/health", get(handle_health))
        .route("/download", post(handle_download))
        .route("/status", get(handle_status))
        .route("/test", post(handle_test))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("could not bind {addr}: {error}")))?;

    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

async fn handle_home() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
        "status": "operational",
        "endpoints": {
            "POST /download": "Download a video",
            "GET /status": "Service status and stored videos",
            "GET /health": "Health check",
            "POST /test": "Connectivity test",
        },
        "documentation": {
            "authentication": "'X-API-Key' header required",
            "example": "curl -X POST /download -H 'X-API-Key: YOUR_KEY' -H 'Content-Type: application/json' -d '{\"video_url\": \"https://youtube.com/watch?v=...\"}'",
        },
    }))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": Utc::now(),
    }))
}

async fn handle_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> Result<Json<DownloadResponse>, ApiError> {
    require_api_key(&state, &headers)?;

    let Json(payload) = payload
        .map_err(|rejection| ApiError::bad_request(format!("invalid request body: {rejection}")))?;
    let video_url = payload
        .video_url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request("missing video_url"))?;
    validate_video_url(video_url)?;

    let video_id = Uuid::new_v4();

    info!("extracting metadata for {video_url}");
    let metadata = fetch_metadata(video_url).await?;

    info!("downloading {:?} as {video_id}", metadata.title);
    let file_path = download_media(video_url, &state.temp_dir, video_id).await?;
    let file_size_bytes = tokio::fs::metadata(&file_path)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "could not stat downloaded file {file_path:?}: {error}"
            ))
        })?
        .len();

    let record = DownloadRecord {
        id: video_id,
        file_path,
        metadata: metadata.clone(),
        downloaded_at: Utc::now(),
        file_size_bytes,
    };

    // The transfer above runs without the lock; only the insert takes it.
    {
        let mut records = state.records.lock().await;
        records
            .insert(record)
            .map_err(|DuplicateId(id)| ApiError::internal(format!("duplicate video id {id}")))?;
    }

    let message = format!("Video downloaded successfully: {}", metadata.title);
    Ok(Json(DownloadResponse {
        success: true,
        video_id,
        video_info: VideoInfoPayload { metadata, video_id },
        file_size_mb: bytes_to_mb(file_size_bytes),
        message,
    }))
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let now = Utc::now();
    let ttl = chrono::Duration::seconds(RECORD_TTL_SECONDS);

    let (evicted, videos, videos_count, total_size_bytes) = {
        let mut records = state.records.lock().await;
        let evicted = records.sweep_expired(now, ttl);
        let videos: Vec<VideoSummary> = records
            .list()
            .into_iter()
            .map(VideoSummary::from_record)
            .collect();
        (evicted, videos, records.count(), records.total_size_bytes())
    };

    // Best-effort file deletion, outside the store lock.
    for record in &evicted {
        match tokio::fs::remove_file(&record.file_path).await {
            Ok(()) => info!("removed expired download {:?}", record.file_path),
            Err(error) => warn!(
                "could not remove expired download {:?}: {error}",
                record.file_path
            ),
        }
    }

    Json(StatusResponse {
        status: "operational",
        videos_count,
        total_size_mb: bytes_to_mb(total_size_bytes),
        videos,
        server_info: ServerInfo {
            temp_dir: state.temp_dir.display().to_string(),
            cleanup_after: CLEANUP_AFTER_LABEL,
            yt_dlp_version: state.yt_dlp_version.clone(),
        },
    })
}

async fn handle_test(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TestResponse>, ApiError> {
    require_api_key(&state, &headers)?;

    Ok(Json(TestResponse {
        success: true,
        message: "Connection successful",
        timestamp: Utc::now(),
    }))
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if api_key_matches(provided, &state.api_key) {
        Ok(())
    } else {
        Err(ApiError::unauthorized())
    }
}

fn api_key_matches(provided: &str, expected: &str) -> bool {
    // Digest comparison keeps the timing independent of where the keys differ.
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

fn validate_video_url(input: &str) -> Result<(), ApiError> {
    let parsed =
        Url::parse(input).map_err(|error| ApiError::extraction(format!("invalid URL: {error}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ApiError::extraction(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }

    Ok(())
}

async fn fetch_metadata(url: &str) -> Result<VideoMetadata, ApiError> {
    let output = run_yt_dlp(vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        url.to_string(),
    ])
    .await?;

    if !output.status.success() {
        return Err(ApiError::extraction(stderr_cause(&output.stderr)));
    }

    let probe: YtDlpProbe = serde_json::from_slice(&output.stdout).map_err(|error| {
        ApiError::extraction(format!("could not parse yt-dlp metadata: {error}"))
    })?;

    Ok(VideoMetadata::from_probe(probe))
}

async fn download_media(url: &str, temp_dir: &Path, video_id: Uuid) -> Result<PathBuf, ApiError> {
    let output_template = temp_dir.join(format!("{video_id}.%(ext)s"));

    let output = run_yt_dlp(vec![
        "-f".to_string(),
        FORMAT_SELECTOR.to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "-o".to_string(),
        output_template.to_string_lossy().into_owned(),
        url.to_string(),
    ])
    .await?;

    if !output.status.success() {
        return Err(ApiError::download_failed(stderr_cause(&output.stderr)));
    }

    resolve_downloaded_file(temp_dir, video_id).await
}

async fn run_yt_dlp(args: Vec<String>) -> Result<std::process::Output, ApiError> {
    let command_future = Command::new("yt-dlp").args(args).output();
    timeout(Duration::from_secs(YT_DLP_TIMEOUT_SECONDS), command_future)
        .await
        .map_err(|_| {
            ApiError::download_failed(format!(
                "yt-dlp did not finish within {YT_DLP_TIMEOUT_SECONDS} seconds"
            ))
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ApiError::internal(
                    "yt-dlp is not installed on the system. Install yt-dlp and restart the server.",
                )
            } else {
                ApiError::internal(format!("could not run yt-dlp: {error}"))
            }
        })
}

async fn probe_yt_dlp_version() -> Option<String> {
    let output = Command::new("yt-dlp")
        .arg("--version")
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    non_empty(&String::from_utf8_lossy(&output.stdout)).map(ToString::to_string)
}

async fn resolve_downloaded_file(temp_dir: &Path, video_id: Uuid) -> Result<PathBuf, ApiError> {
    for extension in VIDEO_EXTENSIONS {
        let candidate = temp_dir.join(format!("{video_id}.{extension}"));
        match tokio::fs::metadata(&candidate).await {
            Ok(metadata) if metadata.is_file() => return Ok(candidate),
            Ok(_) => continue,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => {
                return Err(ApiError::internal(format!(
                    "could not inspect {candidate:?}: {error}"
                )));
            }
        }
    }

    Err(ApiError::no_output_file())
}

fn stderr_cause(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp failed without diagnostic output")
        .to_string()
}

fn truncate_description(value: &str) -> String {
    value.chars().take(DESCRIPTION_MAX_CHARS).collect()
}

fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / 1_048_576.0;
    (mb * 100.0).round() / 100.0
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:5000".to_string()
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
