//! Demucs source separation and ffmpeg export.

use std::path::{Path, PathBuf};

use crate::error::MediaError;
use crate::media::process::{Progress, ProgressSink, Silent, run_tool};
use crate::worker::job::{OutputFormat, truncate};

const TOOL: &str = "demucs";

pub const MODEL: &str = "htdemucs";

/// Stems produced by a full four-way separation, in output order.
pub const STEMS: [&str; 4] = ["vocals", "drums", "bass", "other"];

/// Longest slice of a demucs line echoed into the job message.
const LINE_LIMIT: usize = 100;

/// Demucs invocation arguments. `two_stems` splits into vocals and accompaniment only.
pub fn separate_args(input: &Path, out_dir: &Path, format: OutputFormat, two_stems: bool) -> Vec<String> {
    let mut args = vec!["--name".to_string(), MODEL.to_string()];
    if two_stems {
        args.extend(["--two-stems", "vocals"].map(String::from));
    }
    args.push("--out".to_string());
    args.push(out_dir.to_string_lossy().into_owned());
    args.push(
        match format {
            OutputFormat::Mp3 => "--mp3",
            OutputFormat::Wav => "--float32",
        }
        .to_string(),
    );
    args.push(input.to_string_lossy().into_owned());
    args
}

/// Percentage from a tqdm-style line such as ` 42%|████      | 5.0/12.0`.
pub fn parse_percent(segment: &str) -> Option<f32> {
    if !segment.contains('%') {
        return None;
    }
    segment.split('%').next()?.split_whitespace().last()?.parse().ok()
}

/// Parser mapping demucs output to job progress (15..85), prefixing messages with `label`.
pub fn progress_parser(label: &'static str) -> impl FnMut(&str) -> Option<Progress> {
    move |segment| {
        Some(Progress {
            percent: parse_percent(segment).map(|pct| 15.0 + pct * 0.7),
            message: format!("{label}... {}", truncate(segment, LINE_LIMIT)),
        })
    }
}

/// Locate the per-track directory demucs wrote under `demucs_out/<model>/`.
pub async fn track_dir(demucs_out: &Path) -> Result<PathBuf, MediaError> {
    let model_dir = demucs_out.join(MODEL);
    if !tokio::fs::try_exists(&model_dir).await.unwrap_or(false) {
        return Err(MediaError::MissingOutput(
            "Demucs output directory not found".to_string(),
        ));
    }

    let mut tracks = list_dir(&model_dir).await?;
    tracks.retain(|p| p.is_dir());
    tracks
        .into_iter()
        .next()
        .ok_or_else(|| MediaError::MissingOutput("No separated tracks found".to_string()))
}

/// First file in `track_dir` whose name starts with `stem`.
pub async fn find_stem(track_dir: &Path, stem: &str) -> Result<Option<PathBuf>, MediaError> {
    Ok(list_dir(track_dir).await?.into_iter().find(|path| {
        path.is_file()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(stem))
    }))
}

/// Directory entries sorted by name.
async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, MediaError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Demucs and the ffmpeg used to re-encode its output.
#[derive(Debug, Clone)]
pub struct Demucs {
    command: Vec<String>,
    ffmpeg: Vec<String>,
}

impl Demucs {
    pub fn new(command: Vec<String>, ffmpeg: Vec<String>) -> Self {
        Self { command, ffmpeg }
    }

    /// Separate `input` into `out_dir`, returning the track directory holding the stems.
    pub async fn separate(
        &self,
        input: &Path,
        out_dir: &Path,
        format: OutputFormat,
        two_stems: bool,
        label: &'static str,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf, MediaError> {
        tokio::fs::create_dir_all(out_dir).await?;
        let args = separate_args(input, out_dir, format, two_stems);
        run_tool(TOOL, &self.command, &args, progress_parser(label), sink)
            .await
            .map_err(|e| match e {
                MediaError::ToolFailed { stderr, .. } => MediaError::ToolFailed {
                    tool: "Demucs".to_string(),
                    stderr,
                },
                other => other,
            })?;
        track_dir(out_dir).await
    }

    /// Place `source` at `dest`, copying when the extension already matches
    /// and re-encoding with ffmpeg otherwise.
    pub async fn export(&self, source: &Path, dest: &Path, format: OutputFormat) -> Result<(), MediaError> {
        let same_ext = source
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(format.extension()));

        if same_ext {
            tokio::fs::copy(source, dest).await?;
            return Ok(());
        }

        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            source.to_string_lossy().into_owned(),
        ];
        if format == OutputFormat::Mp3 {
            args.extend(["-b:a", "320k"].map(String::from));
        }
        args.push(dest.to_string_lossy().into_owned());

        run_tool("ffmpeg", &self.ffmpeg, &args, |_| None, &Silent).await?;
        Ok(())
    }
}
