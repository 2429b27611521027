//! Stem separation routes.

use std::io::Write;
use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;
use zip::ZipWriter;
use zip::result::{ZipError, ZipResult};
use zip::write::SimpleFileOptions;

use super::{
    ApiResult, AppState, SeparationForm, admit_separation, error, find_job, finished_output,
    job_status, send_file,
};
use crate::worker::job::{JobOutput, JobRequest, OutputFormat, StemSelection};

const ZIP_NAME: &str = "stems.zip";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/start", post(start))
        .route("/status/{id}", get(job_status))
        .route("/download/{id}", get(download))
}

#[derive(Debug, Deserialize)]
pub struct StemQuery {
    stem: Option<String>,
}

/// POST /api/stems/start (multipart: `file` or `url`, `output_format`, `stems`)
async fn start(State(state): State<AppState>, multipart: Multipart) -> ApiResult {
    let form = SeparationForm::read(multipart).await?;

    let output_format = parse_field::<OutputFormat>(form.output_format.as_deref())?;
    let stems = parse_field::<StemSelection>(form.stems.as_deref())?;
    let source = form.source()?;

    let request = JobRequest::Stems {
        source,
        output_format,
        stems,
    };
    admit_separation(&state, request, form).await
}

/// Parse an optional form value, falling back to the type's default when absent.
pub(super) fn parse_field<T>(value: Option<&str>) -> ApiResult<T>
where
    T: std::str::FromStr<Err = String> + Default,
{
    match value.map(str::trim) {
        None | Some("") => Ok(T::default()),
        Some(raw) => raw.parse().map_err(|e: String| error(StatusCode::BAD_REQUEST, e)),
    }
}

/// GET /api/stems/download/{id}?stem=
///
/// One stem when `stem` names a produced stem, otherwise a ZIP of all of them.
async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StemQuery>,
) -> ApiResult<Response> {
    let job = find_job(&state, &id).await?;
    let JobOutput::Stems { stems, .. } = finished_output(&job)? else {
        return Err(error(StatusCode::BAD_REQUEST, "Not a stems job"));
    };

    if let Some(file_name) = query.stem.as_deref().and_then(|s| stems.get(s)) {
        return send_file(&job.output_dir.join(file_name), file_name, "Stem file not found").await;
    }

    let zip_path = job.output_dir.join(ZIP_NAME);
    if tokio::fs::try_exists(&zip_path).await.unwrap_or(false) {
        return send_file(&zip_path, ZIP_NAME, "File not found").await;
    }

    let files: Vec<(String, PathBuf)> = stems
        .values()
        .map(|name| (name.clone(), job.output_dir.join(name)))
        .collect();

    let target = zip_path.clone();
    let built = tokio::task::spawn_blocking(move || publish_zip(&target, &files)).await;
    match built {
        Ok(Ok(count)) => {
            tracing::debug!(job_id = %job.id, files = count, "Built stems archive");
        }
        Ok(Err(e)) => {
            tracing::error!(job_id = %job.id, error = %e, "Failed to build stems archive");
            return Err(error(StatusCode::INTERNAL_SERVER_ERROR, "Could not build archive"));
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "Archive task failed");
            return Err(error(StatusCode::INTERNAL_SERVER_ERROR, "Could not build archive"));
        }
    }

    send_file(&zip_path, ZIP_NAME, "File not found").await
}

/// Build the archive under a unique staging name beside `target`, then rename
/// it into place so readers never see a partially written file.
pub fn publish_zip(target: &FsPath, files: &[(String, PathBuf)]) -> ZipResult<usize> {
    let staging = target.with_extension(format!("{}.part", Uuid::new_v4().simple()));
    let published = write_zip(&staging, files)
        .and_then(|added| std::fs::rename(&staging, target).map(|()| added).map_err(ZipError::from));
    if published.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    published
}

/// Write every existing file into a deflated archive at `target`. Returns how many were added.
pub fn write_zip(target: &FsPath, files: &[(String, PathBuf)]) -> ZipResult<usize> {
    let mut writer = ZipWriter::new(std::fs::File::create(target)?);
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut added = 0;
    for (name, path) in files {
        let Ok(data) = std::fs::read(path) else {
            continue;
        };
        writer.start_file(name.as_str(), options)?;
        writer.write_all(&data)?;
        added += 1;
    }

    writer.finish()?;
    Ok(added)
}
