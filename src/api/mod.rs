//! HTTP API: thin axum glue over the scheduler and media tools.
//!
//! Every route lives under `/api`. Failures answer `{"error": "..."}` with a
//! 400, 404 or 500 status.

pub mod download;
pub mod karaoke;
pub mod stems;

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderValue, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::config::Config;
use crate::media::{MediaTools, detect_platform};
use crate::worker::job::{AudioSource, Job, JobOutput, JobRequest};
use crate::worker::scheduler::Scheduler;
use crate::worker::state::JobStatus;

/// Shared state for every route.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub media: Arc<MediaTools>,
}

/// Handler result: both arms are complete responses.
pub type ApiResult<T = Json<Value>> = Result<T, Response>;

/// Build the full router.
pub fn router(state: AppState, config: &Config) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .nest("/download", download::routes())
        .nest("/stems", stems::routes())
        .nest("/karaoke", karaoke::routes());

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors(&config.frontend_url))
        .with_state(state)
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<Value> {
    let summary = state.scheduler.summary().await;
    Json(json!({
        "status": "ok",
        "queue_size": summary.queued,
    }))
}

fn cors(frontend_url: &str) -> CorsLayer {
    let frontend = frontend_url.trim_end_matches('/').to_string();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin
                    .to_str()
                    .is_ok_and(|origin| origin_allowed(origin, &frontend))
            },
        ))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// The frontend, local development, and any onrender.com subdomain over https.
pub fn origin_allowed(origin: &str, frontend_url: &str) -> bool {
    if origin == frontend_url || origin == "http://localhost:3000" {
        return true;
    }
    origin
        .strip_prefix("https://")
        .and_then(|host| host.strip_suffix(".onrender.com"))
        .is_some_and(|sub| !sub.is_empty() && !sub.contains('/'))
}

/// `{"error": message}` with `status`.
pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub fn parse_job_id(id: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(id).map_err(|_| error(StatusCode::BAD_REQUEST, "Invalid job id"))
}

async fn find_job(state: &AppState, id: &str) -> ApiResult<Job> {
    let id = parse_job_id(id)?;
    state
        .scheduler
        .get_job(id)
        .await
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "Job not found"))
}

/// The job's output, or 400 while it is not `Done`.
fn finished_output(job: &Job) -> ApiResult<&JobOutput> {
    match (&job.status, &job.result) {
        (JobStatus::Done, Some(output)) => Ok(output),
        _ => Err(error(StatusCode::BAD_REQUEST, "Job not complete")),
    }
}

/// Response body after admitting a job.
async fn admitted(state: &AppState, job: &Job) -> Json<Value> {
    Json(json!({
        "job_id": job.id,
        "status": job.status,
        "queue_position": state.scheduler.queue_position(job.id).await,
    }))
}

/// GET /api/{download|stems|karaoke}/status/{id}
async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let job = find_job(&state, &id).await?;
    let result = match job.status {
        JobStatus::Done => job.result.as_ref(),
        _ => None,
    };

    Ok(Json(json!({
        "job_id": job.id,
        "status": job.status,
        "progress": job.progress,
        "message": job.message,
        "queue_position": state.scheduler.queue_position(job.id).await,
        "result": result,
    })))
}

fn content_type(file_name: &str) -> &'static str {
    let ext = FsPath::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("m4a") => "audio/mp4",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Stream `path` as an attachment named `file_name`.
pub async fn send_file(path: &FsPath, file_name: &str, not_found: &str) -> ApiResult<Response> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Requested file unavailable");
            return Err(error(StatusCode::NOT_FOUND, not_found));
        }
    };

    let safe_name: String = file_name
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .filter(|c| *c != '"' && *c != '\\')
        .collect();
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{safe_name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(content_type(file_name))),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Keep only the final path component of a client-supplied file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    match base {
        "" | "." | ".." => "upload".to_string(),
        base => base.to_string(),
    }
}

/// Fields of a stems or karaoke upload form.
#[derive(Debug, Default)]
pub struct SeparationForm {
    pub file: Option<(String, Bytes)>,
    pub url: Option<String>,
    pub output_format: Option<String>,
    pub stems: Option<String>,
}

impl SeparationForm {
    pub async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();
        let bad = |e: axum::extract::multipart::MultipartError| {
            error(StatusCode::BAD_REQUEST, format!("Invalid form data: {e}"))
        };

        while let Some(field) = multipart.next_field().await.map_err(bad)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let file_name = field.file_name().map(sanitize_file_name);
                    let data = field.bytes().await.map_err(bad)?;
                    if let Some(file_name) = file_name
                        && !data.is_empty()
                    {
                        form.file = Some((file_name, data));
                    }
                }
                "url" => form.url = Some(field.text().await.map_err(bad)?),
                "output_format" => form.output_format = Some(field.text().await.map_err(bad)?),
                "stems" => form.stems = Some(field.text().await.map_err(bad)?),
                _ => {}
            }
        }
        Ok(form)
    }

    /// Decide the audio source; the upload wins when both are present.
    pub fn source(&self) -> ApiResult<AudioSource> {
        if let Some((file_name, _)) = &self.file {
            return Ok(AudioSource::Upload {
                file_name: file_name.clone(),
            });
        }

        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {
                if !detect_platform(url).is_url() {
                    return Err(error(StatusCode::BAD_REQUEST, "Please provide a valid URL"));
                }
                Ok(AudioSource::Remote {
                    url: url.to_string(),
                })
            }
            _ => Err(error(StatusCode::BAD_REQUEST, "Provide either a file or URL")),
        }
    }
}

/// Admit a validated separation request, staging uploaded bytes before the job is queued.
async fn admit_separation(
    state: &AppState,
    request: JobRequest,
    form: SeparationForm,
) -> ApiResult {
    let scheduler = &state.scheduler;
    let internal = |e: &dyn std::fmt::Display| {
        error(StatusCode::INTERNAL_SERVER_ERROR, format!("Could not queue job: {e}"))
    };

    let Some((_, data)) = form.file else {
        let job = scheduler.create_job(request).await.map_err(|e| internal(&e))?;
        return Ok(admitted(state, &job).await);
    };

    let job = scheduler.stage(request).await.map_err(|e| internal(&e))?;
    let source = match &job.params {
        JobRequest::Stems { source, .. } | JobRequest::Karaoke { source, .. } => source,
        JobRequest::Download { .. } => {
            scheduler.discard(job.id).await;
            return Err(error(StatusCode::BAD_REQUEST, "Not a separation request"));
        }
    };

    let input = source.input_path(&job.output_dir);
    if let Err(e) = tokio::fs::write(&input, &data).await {
        tracing::error!(job_id = %job.id, error = %e, "Failed to store upload");
        scheduler.discard(job.id).await;
        return Err(internal(&e));
    }

    if let Err(e) = scheduler.enqueue(job.id) {
        scheduler.discard(job.id).await;
        return Err(internal(&e));
    }

    tracing::info!(job_id = %job.id, bytes = data.len(), "Upload staged");
    Ok(admitted(state, &job).await)
}
