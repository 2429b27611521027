//! Karaoke routes.

use axum::Router;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use serde::Deserialize;

use super::stems::parse_field;
use super::{
    ApiResult, AppState, SeparationForm, admit_separation, error, find_job, finished_output,
    job_status, send_file,
};
use crate::worker::job::{JobOutput, JobRequest, OutputFormat};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/start", post(start))
        .route("/status/{id}", get(job_status))
        .route("/download/{id}", get(download))
}

/// Published when no (or an unknown) track is requested.
const DEFAULT_TRACK: &str = "instrumental";

#[derive(Debug, Deserialize)]
pub struct TrackQuery {
    track: Option<String>,
}

/// POST /api/karaoke/start (multipart: `file` or `url`, `output_format`)
async fn start(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let form = SeparationForm::read(multipart).await?;

    let output_format = parse_field::<OutputFormat>(form.output_format.as_deref())?;
    let source = form.source()?;

    admit_separation(&state, JobRequest::Karaoke { source, output_format }, form).await
}

/// GET /api/karaoke/download/{id}?track=instrumental|vocals
///
/// Unknown or missing `track` falls back to the instrumental.
async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TrackQuery>,
) -> ApiResult<Response> {
    let job = find_job(&state, &id).await?;
    let JobOutput::Karaoke { tracks, .. } = finished_output(&job)? else {
        return Err(error(StatusCode::BAD_REQUEST, "Not a karaoke job"));
    };

    let Some(file_name) = query
        .track
        .as_deref()
        .and_then(|track| tracks.get(track))
        .or_else(|| tracks.get(DEFAULT_TRACK))
    else {
        return Err(error(StatusCode::NOT_FOUND, "No tracks available"));
    };

    send_file(&job.output_dir.join(file_name), file_name, "Track file not found").await
}
