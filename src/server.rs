use axum::{
    Json, Router, async_trait,
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::audio::content_type_for;
use crate::covers::DEFAULT_COVER_URL;
use crate::download::{PlaylistDownloader, PlaylistSource};
use crate::duplicates::{DuplicateReport, RemovalMode, remove_duplicates};
use crate::jobs::JobRegistry;
use crate::library::{MEDIA_URL_PREFIX, MusicLibrary, ROOT_PLAYLIST};

pub use crate::error::ApiError;

const DEFAULT_COVER_SVG: &str = include_str!("../assets/default-cover.svg");

#[derive(Clone)]
pub struct AppState {
    pub library: MusicLibrary,
    pub downloader: PlaylistDownloader,
    pub jobs: JobRegistry,
}

impl AppState {
    pub fn new(library: MusicLibrary, source: Arc<dyn PlaylistSource>) -> Self {
        Self {
            downloader: PlaylistDownloader::new(source, library.clone()),
            library,
            jobs: JobRegistry::new(),
        }
    }
}

/// Router settings that do not belong to the state.
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub static_dir: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            static_dir: None,
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

pub fn create_router(state: AppState, options: &RouterOptions) -> Router {
    let mut router = Router::new()
        .route("/", get(root))
        .route("/list_playlists", get(list_playlists))
        .route("/list_music", get(list_music))
        .route("/check_music_changes", get(check_music_changes))
        .route("/create_playlist", post(create_playlist))
        .route("/upload_to_playlist", post(upload_to_playlist))
        .route("/extract_playlist_name", post(extract_playlist_name))
        .route("/download_playlist", post(download_playlist))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/duplicates", get(preview_duplicates))
        .route("/remove_duplicates", post(remove_duplicates_handler))
        .route("/musics/*path", get(serve_media));

    if let Some(dir) = &options.static_dir {
        tracing::info!("Serving frontend from {}", dir.display());
        router = router.nest_service("/web", ServeDir::new(dir));
    }

    router
        .layer(DefaultBodyLimit::max(options.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// JSON request body whose rejections use the API error envelope.
struct JsonBody<T>(T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

/// Root endpoint
async fn root() -> &'static str {
    concat!("Musickera API v", env!("CARGO_PKG_VERSION"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Trimmed URL, or an error if it is missing or not http(s).
fn require_http_url(url: Option<String>) -> Result<String, ApiError> {
    let url = non_empty(url).ok_or_else(|| ApiError::invalid("URL is required."))?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ApiError::invalid(
            "Invalid URL. Paste a full link starting with http(s)://",
        ));
    }
    Ok(url)
}

/// List every playlist with its cover
async fn list_playlists(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let playlists = state.library.list_playlists().await?;
    Ok(Json(serde_json::json!({
        "count": playlists.len(),
        "playlists": playlists,
    })))
}

#[derive(Debug, Deserialize)]
struct ListMusicParams {
    playlist: Option<String>,
    skip_metadata: Option<String>,
}

/// List tracks, optionally restricted to one playlist
async fn list_music(
    State(state): State<AppState>,
    Query(params): Query<ListMusicParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let playlist = non_empty(params.playlist);
    let skip_metadata = match params.skip_metadata {
        Some(raw) => raw.trim().eq_ignore_ascii_case("true"),
        None => playlist.is_some(),
    };

    let music = state
        .library
        .list_tracks(playlist.as_deref(), skip_metadata)
        .await?;
    Ok(Json(serde_json::json!({
        "count": music.len(),
        "music": music,
    })))
}

#[derive(Debug, Deserialize)]
struct ChangesParams {
    playlist: Option<String>,
    last_check: Option<String>,
}

/// Files modified since the client's last poll
async fn check_music_changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let playlist = non_empty(params.playlist);
    let last_check = params
        .last_check
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .unwrap_or(0.0);

    let changes = state
        .library
        .changes_since(playlist.as_deref(), last_check)
        .await?;
    let current_time = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;

    Ok(Json(serde_json::json!({
        "count": changes.len(),
        "changes": changes,
        "current_time": current_time,
    })))
}

#[derive(Debug, Deserialize)]
struct CreatePlaylistRequest {
    name: Option<String>,
}

async fn create_playlist(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CreatePlaylistRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let created = state
        .library
        .create_playlist(request.name.as_deref().unwrap_or_default())
        .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "path": format!("{}/{}", MEDIA_URL_PREFIX, created.name),
        "playlist": created.name,
    })))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    uploaded: Vec<String>,
    errors: Vec<String>,
    playlist: String,
}

/// Upload one or more audio files into a playlist
async fn upload_to_playlist(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut playlist_name = None;
    let mut files = Vec::new();

    // The playlist field may arrive after the files, so buffer everything first.
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid(format!("Invalid upload: {}", e)))?
    {
        match field.name() {
            Some("playlist") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::invalid(format!("Invalid playlist field: {}", e)))?;
                playlist_name = non_empty(Some(value));
            }
            Some("file") => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::invalid(format!("Failed to read {}: {}", file_name, e)))?;
                files.push((file_name, data));
            }
            other => tracing::debug!("Ignoring upload field {:?}", other),
        }
    }

    if files.is_empty() {
        return Err(ApiError::invalid("No file uploaded"));
    }

    let playlist = state
        .library
        .create_playlist(playlist_name.as_deref().unwrap_or(ROOT_PLAYLIST))
        .await?;

    let mut uploaded = Vec::new();
    let mut errors = Vec::new();
    for (file_name, data) in files {
        if file_name.is_empty() {
            continue;
        }
        match state.library.save_upload(&playlist, &file_name, &data).await {
            Ok(saved) => uploaded.push(saved),
            Err(e) => {
                tracing::warn!("Upload of {} rejected: {}", file_name, e);
                errors.push(e.to_string());
            }
        }
    }

    tracing::info!(
        "Upload to '{}': {} saved, {} rejected",
        playlist.name,
        uploaded.len(),
        errors.len()
    );

    Ok(Json(UploadResponse {
        success: !uploaded.is_empty(),
        uploaded,
        errors,
        playlist: playlist.name,
    }))
}

#[derive(Debug, Deserialize)]
struct UrlRequest {
    url: Option<String>,
}

async fn extract_playlist_name(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<UrlRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let url = require_http_url(request.url)?;
    let playlist_name = state.downloader.playlist_name(&url).await;
    Ok(Json(serde_json::json!({
        "success": true,
        "playlist_name": playlist_name,
    })))
}

#[derive(Debug, Deserialize)]
struct DownloadRequest {
    url: Option<String>,
    playlist: Option<String>,
    #[serde(default)]
    background: bool,
}

/// Download a playlist, inline or as a background job
async fn download_playlist(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<DownloadRequest>,
) -> Result<Response, ApiError> {
    let url = require_http_url(request.url)?;
    let playlist = request.playlist;

    if request.background {
        let downloader = state.downloader.clone();
        let job_url = url.clone();
        let job_playlist = playlist.clone();
        let job_id = state
            .jobs
            .submit(&url, playlist, async move {
                downloader.download(&job_url, job_playlist.as_deref()).await
            })
            .await;

        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "success": true,
                "message": "Download started in the background.",
                "job_id": job_id,
            })),
        )
            .into_response());
    }

    let report = state.downloader.download(&url, playlist.as_deref()).await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    Ok((status, Json(report)).into_response())
}

async fn list_jobs(State(state): State<AppState>) -> Json<serde_json::Value> {
    let jobs = state.jobs.list().await;
    Json(serde_json::json!({
        "count": jobs.len(),
        "jobs": jobs,
    }))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::jobs::Job>, ApiError> {
    state
        .jobs
        .get(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Job not found: {}", id)))
}

#[derive(Debug, Serialize)]
struct DuplicatesResponse {
    success: bool,
    playlist: String,
    count: usize,
    #[serde(flatten)]
    report: DuplicateReport,
}

async fn run_duplicates(
    state: &AppState,
    playlist: Option<String>,
    mode: RemovalMode,
) -> Result<Json<DuplicatesResponse>, ApiError> {
    let (playlist, dir) = match non_empty(playlist) {
        Some(name) => {
            let dir = state.library.playlist_dir(&name)?;
            (name, dir)
        }
        None => (ROOT_PLAYLIST.to_string(), state.library.root().to_path_buf()),
    };

    let report = tokio::task::spawn_blocking(move || remove_duplicates(&dir, mode))
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("Duplicate scan aborted: {}", e)))??;

    Ok(Json(DuplicatesResponse {
        success: report.failed == 0,
        playlist,
        count: report.groups.len(),
        report,
    }))
}

#[derive(Debug, Deserialize)]
struct DuplicatesParams {
    playlist: Option<String>,
}

/// Report duplicate groups without touching anything
async fn preview_duplicates(
    State(state): State<AppState>,
    Query(params): Query<DuplicatesParams>,
) -> Result<Json<DuplicatesResponse>, ApiError> {
    run_duplicates(&state, params.playlist, RemovalMode::Preview).await
}

#[derive(Debug, Default, Deserialize)]
struct RemoveDuplicatesRequest {
    playlist: Option<String>,
    dry_run: Option<bool>,
}

/// Remove duplicates; a dry run unless `dry_run` is explicitly false
async fn remove_duplicates_handler(
    State(state): State<AppState>,
    request: Option<Json<RemoveDuplicatesRequest>>,
) -> Result<Json<DuplicatesResponse>, ApiError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let mode = if request.dry_run.unwrap_or(true) {
        RemovalMode::Preview
    } else {
        RemovalMode::Delete
    };
    tracing::info!("Duplicate removal requested ({:?})", mode);
    run_duplicates(&state, request.playlist, mode).await
}

/// Serve an audio or cover file from the music root with HTTP Range support
async fn serve_media(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = match state.library.resolve_media_path(&path).await {
        Ok(resolved) => resolved,
        Err(ApiError::NotFound(_)) if is_default_cover(&path) => {
            return Ok(([(header::CONTENT_TYPE, "image/svg+xml")], DEFAULT_COVER_SVG).into_response());
        }
        Err(e) => return Err(e),
    };

    let content_type = content_type_for(&resolved);
    let file_size = tokio::fs::metadata(&resolved).await?.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_range(value, file_size));

    if let Some((start, end)) = range {
        return stream_range(&resolved, start, end, file_size, content_type).await;
    }

    tracing::debug!("Serving {} ({} bytes)", resolved.display(), file_size);
    let file = tokio::fs::File::open(&resolved).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, file_size.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn is_default_cover(path: &str) -> bool {
    DEFAULT_COVER_URL
        .strip_prefix(MEDIA_URL_PREFIX)
        .and_then(|p| p.strip_prefix('/'))
        == Some(path)
}

/// Parse a single `bytes=` range into inclusive offsets.
///
/// Accepts `start-end`, `start-` and `-suffix`. Anything unsatisfiable is
/// `None` and the whole file is served instead.
fn parse_range(value: &str, file_size: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if file_size == 0 {
        return None;
    }
    let last = file_size - 1;

    match (start.is_empty(), end.is_empty()) {
        (false, false) => {
            let start = start.parse::<u64>().ok()?;
            let end = end.parse::<u64>().ok()?;
            (start <= end && start < file_size).then(|| (start, end.min(last)))
        }
        (false, true) => {
            let start = start.parse::<u64>().ok()?;
            (start < file_size).then_some((start, last))
        }
        (true, false) => {
            let suffix = end.parse::<u64>().ok()?;
            (suffix > 0).then(|| (file_size - suffix.min(file_size), last))
        }
        (true, true) => None,
    }
}

/// Stream an inclusive byte range of a file as 206 Partial Content
async fn stream_range(
    path: &std::path::Path,
    start: u64,
    end: u64,
    total_size: u64,
    content_type: &str,
) -> Result<Response, ApiError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;

    let length = end - start + 1;
    tracing::debug!("Serving range {}-{}/{} ({} bytes)", start, end, total_size, length);

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, length.to_string()),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, total_size),
            ),
        ],
        Body::from_stream(ReaderStream::new(file.take(length))),
    )
        .into_response())
}
