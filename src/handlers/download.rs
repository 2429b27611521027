//! Download handler: fetches media with yt-dlp, or spotdl for Spotify links.

use std::path::Path;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::{HandlerError, MediaError};
use crate::handlers::handler::JobHandler;
use crate::media::{Platform, SpotDl, YtDlp};
use crate::worker::job::{JobKind, JobOutput, JobRequest};

/// Side files that never count as the downloaded media.
const SIDE_FILE_EXTENSIONS: &[&str] = &["jpg", "png", "webp", "json", "part", "ytdl"];

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "ogg", "wav", "flac"];

fn extension(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

fn is_media_file(name: &str) -> bool {
    extension(name).is_none_or(|ext| !SIDE_FILE_EXTENSIONS.contains(&ext.as_str()))
}

fn is_audio_file(name: &str) -> bool {
    extension(name).is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

/// First regular file in `dir` (by name) accepted by `accept`.
pub async fn primary_output(
    dir: &Path,
    accept: fn(&str) -> bool,
) -> Result<Option<String>, MediaError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names.into_iter().find(|name| accept(name)))
}

/// Runs `Download` jobs.
pub struct DownloadHandler {
    ytdlp: YtDlp,
    spotdl: SpotDl,
}

impl DownloadHandler {
    pub fn new(ytdlp: YtDlp, spotdl: SpotDl) -> Self {
        Self { ytdlp, spotdl }
    }

    async fn from_spotify(&self, ctx: &JobContext, url: &str) -> Result<JobOutput, HandlerError> {
        self.spotdl.download(url, ctx.output_dir(), ctx).await?;

        let filename = primary_output(ctx.output_dir(), is_audio_file)
            .await?
            .ok_or_else(|| {
                MediaError::MissingOutput(
                    "Spotify download completed but no output file found".to_string(),
                )
            })?;
        let title = Path::new(&filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.clone());

        Ok(JobOutput::Download {
            filename,
            title,
            metadata: None,
        })
    }
}

#[async_trait]
impl JobHandler for DownloadHandler {
    fn kind(&self) -> JobKind {
        JobKind::Download
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
        let JobRequest::Download {
            url,
            format_id,
            media,
            platform,
        } = &ctx.params
        else {
            return Err(HandlerError::InvalidInput(format!(
                "Expected a download request, got {}",
                ctx.params.kind()
            )));
        };

        ctx.report(10.0, format!("Downloading from {platform}...")).await;

        if *platform == Platform::Spotify {
            return self.from_spotify(&ctx, url).await;
        }

        let info = self
            .ytdlp
            .download(url, format_id, *media, ctx.output_dir(), &ctx)
            .await?;

        let filename = primary_output(ctx.output_dir(), is_media_file)
            .await?
            .ok_or_else(|| {
                MediaError::MissingOutput("Download completed but no output file found".to_string())
            })?;

        tracing::info!(job_id = %ctx.job_id, file = %filename, "Download finished");

        Ok(JobOutput::Download {
            filename,
            title: info.title.unwrap_or_else(|| "Download".to_string()),
            metadata: Some(info.metadata),
        })
    }
}
