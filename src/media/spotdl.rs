//! spotdl wrapper for Spotify downloads.

use std::path::Path;

use crate::error::MediaError;
use crate::media::process::{Progress, ProgressSink, run_tool};
use crate::media::ytdlp::FormatInfo;
use crate::worker::job::MediaKind;

const TOOL: &str = "spotdl";

/// The single format offered for Spotify links.
pub fn spotify_format() -> FormatInfo {
    FormatInfo {
        format_id: "spotify_mp3".to_string(),
        ext: "mp3".to_string(),
        media: MediaKind::Audio,
        format_note: "320kbps MP3 via spotdl".to_string(),
        abr: Some(320.0),
        is_best: true,
        ..FormatInfo::default()
    }
}

pub fn download_args(url: &str, output_dir: &Path) -> Vec<String> {
    vec![
        "download".to_string(),
        url.to_string(),
        "--output".to_string(),
        output_dir.to_string_lossy().into_owned(),
        "--format".to_string(),
        "mp3".to_string(),
        "--bitrate".to_string(),
        "320k".to_string(),
    ]
}

/// spotdl bound to a configured executable.
#[derive(Debug, Clone)]
pub struct SpotDl {
    command: Vec<String>,
}

impl SpotDl {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// Download a track, album or playlist into `output_dir` as 320k mp3.
    pub async fn download(
        &self,
        url: &str,
        output_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<(), MediaError> {
        sink.update(Progress::new(10.0, "Fetching from Spotify...")).await;
        let args = download_args(url, output_dir);
        run_tool(TOOL, &self.command, &args, |_| None, sink).await?;
        sink.update(Progress::new(90.0, "Processing...")).await;
        Ok(())
    }
}
