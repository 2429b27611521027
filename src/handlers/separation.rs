//! Stem separation and karaoke handlers, both built on Demucs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::{HandlerError, MediaError};
use crate::handlers::handler::JobHandler;
use crate::media::demucs::{STEMS, find_stem};
use crate::media::{Demucs, YtDlp};
use crate::worker::job::{AudioSource, JobKind, JobOutput, JobRequest, OutputFormat};

/// Scratch directory demucs writes into, removed once outputs are exported.
const DEMUCS_DIR: &str = "demucs_out";

/// Karaoke outputs: demucs stem name and the label it is published under.
const KARAOKE_TRACKS: [(&str, &str); 2] = [("no_vocals", "instrumental"), ("vocals", "vocals")];

/// Shared input staging and separation for both handlers.
#[derive(Debug, Clone)]
pub struct Separator {
    ytdlp: YtDlp,
    demucs: Demucs,
}

impl Separator {
    pub fn new(ytdlp: YtDlp, demucs: Demucs) -> Self {
        Self { ytdlp, demucs }
    }

    /// Locate the job's input audio, downloading it first for remote sources.
    async fn input(&self, ctx: &JobContext, source: &AudioSource) -> Result<PathBuf, HandlerError> {
        let staged = source.input_path(ctx.output_dir());

        let input = match source {
            AudioSource::Upload { .. } => Some(staged),
            AudioSource::Remote { url } => {
                ctx.report(5.0, "Downloading audio from URL...").await;
                self.ytdlp.download_audio(url, &staged).await?;
                downloaded_input(ctx.output_dir()).await?
            }
        };

        let missing = || HandlerError::InvalidInput("No input audio file found".to_string());
        let path = input.ok_or_else(missing)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(missing());
        }
        Ok(path)
    }

    /// Run demucs and export the wanted stems as `<label>.<ext>`.
    async fn separate(
        &self,
        ctx: &JobContext,
        input: &Path,
        format: OutputFormat,
        two_stems: bool,
        label: &'static str,
        wanted: &[(&str, &str)],
    ) -> Result<BTreeMap<String, String>, HandlerError> {
        let scratch = ctx.output_dir().join(DEMUCS_DIR);
        let track_dir = self
            .demucs
            .separate(input, &scratch, format, two_stems, label, ctx)
            .await?;

        ctx.report(85.0, "Preparing output files...").await;

        let ext = format.extension();
        let mut files = BTreeMap::new();
        for &(stem, published) in wanted {
            let Some(source) = find_stem(&track_dir, stem).await? else {
                tracing::debug!(job_id = %ctx.job_id, stem, "Stem missing from demucs output");
                continue;
            };
            let file_name = format!("{published}.{ext}");
            self.demucs
                .export(&source, &ctx.output_dir().join(&file_name), format)
                .await?;
            files.insert(published.to_string(), file_name);
        }

        ctx.report(95.0, "Cleaning up...").await;
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::warn!(job_id = %ctx.job_id, error = %e, "Failed to remove demucs scratch directory");
        }

        if files.is_empty() {
            return Err(HandlerError::Failed("No separated tracks found".to_string()));
        }
        Ok(files)
    }
}

/// The file yt-dlp left as `input_audio.*`, skipping partial downloads.
async fn downloaded_input(dir: &Path) -> Result<Option<PathBuf>, HandlerError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(MediaError::Io)?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(MediaError::Io)? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("input_audio") && !name.ends_with(".part") {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

/// Runs `Stems` jobs: four-way separation, optionally keeping a single stem.
pub struct StemsHandler {
    separator: Separator,
}

impl StemsHandler {
    pub fn new(separator: Separator) -> Self {
        Self { separator }
    }
}

#[async_trait]
impl JobHandler for StemsHandler {
    fn kind(&self) -> JobKind {
        JobKind::Stems
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
        let JobRequest::Stems {
            source,
            output_format,
            stems,
        } = &ctx.params
        else {
            return Err(HandlerError::InvalidInput(format!(
                "Expected a stems request, got {}",
                ctx.params.kind()
            )));
        };

        let input = self.separator.input(&ctx, source).await?;
        ctx.report(15.0, "Running stem separation with Demucs...").await;

        let wanted: Vec<(&str, &str)> = STEMS
            .iter()
            .filter(|stem| stems.includes(stem))
            .map(|&stem| (stem, stem))
            .collect();

        let files = self
            .separator
            .separate(&ctx, &input, *output_format, false, "Separating stems", &wanted)
            .await?;

        Ok(JobOutput::Stems {
            stems: files,
            format: output_format.extension().to_string(),
        })
    }
}

/// Runs `Karaoke` jobs: vocals against everything else.
pub struct KaraokeHandler {
    separator: Separator,
}

impl KaraokeHandler {
    pub fn new(separator: Separator) -> Self {
        Self { separator }
    }
}

#[async_trait]
impl JobHandler for KaraokeHandler {
    fn kind(&self) -> JobKind {
        JobKind::Karaoke
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutput, HandlerError> {
        let JobRequest::Karaoke {
            source,
            output_format,
        } = &ctx.params
        else {
            return Err(HandlerError::InvalidInput(format!(
                "Expected a karaoke request, got {}",
                ctx.params.kind()
            )));
        };

        let input = self.separator.input(&ctx, source).await?;
        ctx.report(15.0, "Creating karaoke track with Demucs...").await;

        let tracks = self
            .separator
            .separate(&ctx, &input, *output_format, true, "Removing vocals", &KARAOKE_TRACKS)
            .await?;

        Ok(JobOutput::Karaoke {
            tracks,
            format: output_format.extension().to_string(),
        })
    }
}
