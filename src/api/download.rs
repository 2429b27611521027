//! Download routes: song search, format listing, download jobs.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use super::{ApiResult, AppState, admitted, error, find_job, finished_output, job_status, send_file};
use crate::media::spotdl::spotify_format;
use crate::media::ytdlp::DEFAULT_SEARCH_RESULTS;
use crate::media::{Platform, detect_platform};
use crate::worker::job::{JobOutput, JobRequest, MediaKind};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/search", get(search))
        .route("/formats", get(formats))
        .route("/start", post(start))
        .route("/status/{id}", get(job_status))
        .route("/file/{id}", get(file))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(Debug, Deserialize)]
pub struct FormatsQuery {
    #[serde(default)]
    url: String,
}

fn default_format_id() -> String {
    "best".to_string()
}

/// Body of `POST /api/download/start`.
#[derive(Debug, Deserialize)]
pub struct DownloadStart {
    pub url: String,
    #[serde(default = "default_format_id")]
    pub format_id: String,
    #[serde(rename = "type", default)]
    pub media: MediaKind,
}

/// Reject plain text where a URL is required.
fn require_url(url: &str) -> ApiResult<Platform> {
    match detect_platform(url) {
        Platform::Search => Err(error(StatusCode::BAD_REQUEST, "Please provide a valid URL")),
        platform => Ok(platform),
    }
}

/// GET /api/download/search?q=
async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> ApiResult {
    let q = query.q.trim();
    if q.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "Query parameter 'q' is required"));
    }

    let results = state
        .media
        .ytdlp
        .search(q, DEFAULT_SEARCH_RESULTS)
        .await
        .map_err(|e| {
            tracing::warn!(query = q, error = %e, "Search failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    Ok(Json(json!({ "results": results })))
}

/// GET /api/download/formats?url=
async fn formats(State(state): State<AppState>, Query(query): Query<FormatsQuery>) -> ApiResult {
    let url = query.url.trim();
    if url.chars().count() < 5 {
        return Err(error(StatusCode::BAD_REQUEST, "Query parameter 'url' is required"));
    }
    let platform = require_url(url)?;

    if platform == Platform::Spotify {
        return Ok(Json(json!({
            "platform": platform,
            "metadata": { "title": "Spotify Track" },
            "video_formats": [],
            "audio_formats": [spotify_format()],
        })));
    }

    let listing = state.media.ytdlp.formats(url).await.map_err(|e| {
        tracing::warn!(url, error = %e, "Format probe failed");
        error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(json!({
        "platform": platform,
        "metadata": listing.metadata,
        "video_formats": listing.video_formats,
        "audio_formats": listing.audio_formats,
    })))
}

/// POST /api/download/start
async fn start(State(state): State<AppState>, Json(body): Json<DownloadStart>) -> ApiResult {
    let url = body.url.trim().to_string();
    let platform = require_url(&url)?;

    let request = JobRequest::Download {
        url,
        format_id: body.format_id,
        media: body.media,
        platform,
    };
    let job = state.scheduler.create_job(request).await.map_err(|e| {
        error(StatusCode::INTERNAL_SERVER_ERROR, format!("Could not queue job: {e}"))
    })?;

    Ok(admitted(&state, &job).await)
}

/// GET /api/download/file/{id}
async fn file(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let job = find_job(&state, &id).await?;
    let JobOutput::Download { filename, .. } = finished_output(&job)? else {
        return Err(error(StatusCode::BAD_REQUEST, "Not a download job"));
    };

    send_file(&job.output_dir.join(filename), filename, "File not found").await
}
