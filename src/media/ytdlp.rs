//! yt-dlp wrapper: format probing, song search and downloads.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::media::process::{Progress, ProgressSink, Silent, run_tool};
use crate::worker::job::{MediaKind, TrackMetadata, truncate};

const TOOL: &str = "yt-dlp";

/// Longest description returned by a format probe.
const DESCRIPTION_LIMIT: usize = 500;

pub const DEFAULT_SEARCH_RESULTS: usize = 10;

static DOWNLOAD_PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[download\]\s+(\d+(?:\.\d+)?)%").expect("valid regex"));

/// Descriptive fields of a probed URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaMetadata {
    pub title: String,
    pub duration: Option<f64>,
    pub thumbnail: String,
    pub channel: String,
    pub upload_date: String,
    pub description: String,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
}

/// One downloadable format.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormatInfo {
    pub format_id: String,
    pub ext: String,
    pub filesize: Option<u64>,
    pub format_note: String,
    pub quality: Option<f64>,
    pub tbr: Option<f64>,
    #[serde(rename = "type")]
    pub media: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_audio: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr: Option<f64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_best: bool,
}

/// Result of a format probe, best formats first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FormatListing {
    pub metadata: MediaMetadata,
    pub video_formats: Vec<FormatInfo>,
    pub audio_formats: Vec<FormatInfo>,
}

/// A song search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub url: String,
    pub duration: Option<f64>,
    pub thumbnail: String,
    pub channel: String,
    pub view_count: Option<u64>,
}

/// What a finished download left behind, as reported by yt-dlp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadInfo {
    pub title: Option<String>,
    pub metadata: TrackMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFormat {
    format_id: Option<String>,
    ext: Option<String>,
    filesize: Option<u64>,
    filesize_approx: Option<u64>,
    format_note: Option<String>,
    quality: Option<f64>,
    tbr: Option<f64>,
    vcodec: Option<String>,
    acodec: Option<String>,
    resolution: Option<String>,
    width: Option<u64>,
    height: Option<u64>,
    fps: Option<f64>,
    abr: Option<f64>,
    asr: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInfo {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    thumbnails: Vec<RawThumbnail>,
    channel: Option<String>,
    uploader: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    upload_date: Option<String>,
    description: Option<String>,
    view_count: Option<u64>,
    like_count: Option<u64>,
    formats: Vec<RawFormat>,
    entries: Vec<Option<RawInfo>>,
}

impl RawInfo {
    fn channel(&self) -> String {
        self.channel
            .clone()
            .or_else(|| self.uploader.clone())
            .unwrap_or_default()
    }
}

fn has_codec(codec: &Option<String>) -> bool {
    matches!(codec.as_deref(), Some(c) if !c.is_empty() && c != "none")
}

fn parse_json(stdout: &str) -> Result<RawInfo, MediaError> {
    serde_json::from_str(stdout.trim()).map_err(|e| MediaError::Parse {
        tool: TOOL.to_string(),
        reason: e.to_string(),
    })
}

/// Turn `yt-dlp -J` output into a format listing.
pub fn parse_formats(stdout: &str) -> Result<FormatListing, MediaError> {
    let info = parse_json(stdout)?;

    let metadata = MediaMetadata {
        title: info.title.clone().unwrap_or_else(|| "Unknown".to_string()),
        duration: info.duration,
        thumbnail: info.thumbnail.clone().unwrap_or_default(),
        channel: info.channel(),
        upload_date: info.upload_date.clone().unwrap_or_default(),
        description: truncate(info.description.as_deref().unwrap_or_default(), DESCRIPTION_LIMIT),
        view_count: info.view_count,
        like_count: info.like_count,
    };

    let mut video_formats = Vec::new();
    let mut audio_formats = Vec::new();

    for raw in info.formats {
        let mut format = FormatInfo {
            format_id: raw.format_id.unwrap_or_default(),
            ext: raw.ext.unwrap_or_default(),
            filesize: raw.filesize.or(raw.filesize_approx),
            format_note: raw.format_note.unwrap_or_default(),
            quality: raw.quality,
            tbr: raw.tbr,
            ..FormatInfo::default()
        };

        let has_video = has_codec(&raw.vcodec);
        let has_audio = has_codec(&raw.acodec);

        if has_video {
            format.media = MediaKind::Video;
            format.resolution = Some(raw.resolution.unwrap_or_else(|| {
                let dim = |v: Option<u64>| v.map_or_else(|| "?".to_string(), |v| v.to_string());
                format!("{}x{}", dim(raw.width), dim(raw.height))
            }));
            format.fps = raw.fps;
            format.vcodec = raw.vcodec;
            format.acodec = if has_audio { raw.acodec } else { None };
            format.has_audio = Some(has_audio);
            video_formats.push(format);
        } else if has_audio {
            format.media = MediaKind::Audio;
            format.acodec = raw.acodec;
            format.abr = raw.abr;
            format.asr = raw.asr;
            audio_formats.push(format);
        }
    }

    let rate = |f: &FormatInfo| f.tbr.unwrap_or(0.0);
    let audio_rate = |f: &FormatInfo| f.tbr.or(f.abr).unwrap_or(0.0);
    video_formats.sort_by(|a, b| rate(b).total_cmp(&rate(a)));
    audio_formats.sort_by(|a, b| audio_rate(b).total_cmp(&audio_rate(a)));

    if let Some(best) = video_formats.first_mut() {
        best.is_best = true;
    }
    if let Some(best) = audio_formats.first_mut() {
        best.is_best = true;
    }

    Ok(FormatListing {
        metadata,
        video_formats,
        audio_formats,
    })
}

/// Turn flat-playlist `ytsearchN:` output into search results.
pub fn parse_search(stdout: &str) -> Result<Vec<SearchResult>, MediaError> {
    let info = parse_json(stdout)?;

    Ok(info
        .entries
        .into_iter()
        .flatten()
        .map(|entry| {
            let id = entry.id.clone().unwrap_or_default();
            let thumbnail = entry
                .thumbnails
                .last()
                .and_then(|t| t.url.clone())
                .or_else(|| entry.thumbnail.clone())
                .unwrap_or_default();
            SearchResult {
                url: entry
                    .url
                    .clone()
                    .or_else(|| entry.webpage_url.clone())
                    .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}")),
                title: entry.title.clone().unwrap_or_else(|| "Unknown".to_string()),
                duration: entry.duration,
                channel: entry.channel(),
                view_count: entry.view_count,
                thumbnail,
                id,
            }
        })
        .collect())
}

/// Read the info JSON yt-dlp prints after a download. The last JSON line wins.
pub fn parse_download_info(stdout: &str) -> DownloadInfo {
    let Some(info) = stdout
        .lines()
        .rev()
        .filter(|line| line.trim_start().starts_with('{'))
        .find_map(|line| serde_json::from_str::<RawInfo>(line).ok())
    else {
        return DownloadInfo::default();
    };

    DownloadInfo {
        title: info.title.clone(),
        metadata: TrackMetadata {
            title: info.title.clone(),
            artist: info
                .artist
                .clone()
                .or_else(|| info.channel.clone())
                .or_else(|| info.uploader.clone()),
            album: info.album.clone(),
            duration: info.duration,
        },
    }
}

/// Map a yt-dlp output segment to job progress (10..90).
pub fn parse_progress(segment: &str) -> Option<Progress> {
    if let Some(caps) = DOWNLOAD_PERCENT.captures(segment) {
        let pct: f32 = caps[1].parse().ok()?;
        return Some(Progress::new(10.0 + pct * 0.8, format!("Downloading... {}%", &caps[1])));
    }
    if segment.starts_with("[Merger]")
        || segment.starts_with("[ExtractAudio]")
        || segment.starts_with("[EmbedThumbnail]")
        || segment.starts_with("[Metadata]")
    {
        return Some(Progress::new(90.0, "Processing..."));
    }
    None
}

/// Format selector for a download request.
pub fn format_selector(format_id: &str, media: MediaKind) -> String {
    match (format_id, media) {
        (id, _) if !id.is_empty() && id != "best" => id.to_string(),
        (_, MediaKind::Audio) => "bestaudio/best".to_string(),
        (_, MediaKind::Video) => "bestvideo+bestaudio/best".to_string(),
    }
}

/// Arguments for a full download into `output_dir`.
pub fn download_args(url: &str, format_id: &str, media: MediaKind, output_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--format".to_string(),
        format_selector(format_id, media),
        "--output".to_string(),
        output_dir.join("%(title)s.%(ext)s").to_string_lossy().into_owned(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--progress".to_string(),
        "--dump-json".to_string(),
        "--no-simulate".to_string(),
        "--embed-metadata".to_string(),
        "--embed-thumbnail".to_string(),
    ];

    match media {
        MediaKind::Audio => args.extend(
            ["--extract-audio", "--audio-format", "mp3", "--audio-quality", "320K"]
                .map(String::from),
        ),
        MediaKind::Video => {
            args.extend(["--merge-output-format", "mp4"].map(String::from));
        }
    }

    args.push(url.to_string());
    args
}

/// Arguments for fetching best audio as mp3 to `output` (whose extension is replaced).
pub fn audio_args(url: &str, output: &Path) -> Vec<String> {
    let template = output.with_extension("%(ext)s");
    vec![
        "--format".to_string(),
        "bestaudio/best".to_string(),
        "--output".to_string(),
        template.to_string_lossy().into_owned(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--extract-audio".to_string(),
        "--audio-format".to_string(),
        "mp3".to_string(),
        "--audio-quality".to_string(),
        "320K".to_string(),
        url.to_string(),
    ]
}

/// yt-dlp bound to a configured executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    command: Vec<String>,
}

impl YtDlp {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// List metadata and available formats without downloading.
    pub async fn formats(&self, url: &str) -> Result<FormatListing, MediaError> {
        let args = ["-J", "--no-warnings", "--no-playlist", url].map(String::from);
        let output = run_tool(TOOL, &self.command, &args, |_| None, &Silent).await?;
        parse_formats(&output.stdout)
    }

    /// Search YouTube for songs matching `query`.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>, MediaError> {
        let args = [
            "-J".to_string(),
            "--no-warnings".to_string(),
            "--flat-playlist".to_string(),
            format!("ytsearch{max_results}:{query}"),
        ];
        let output = run_tool(TOOL, &self.command, &args, |_| None, &Silent).await?;
        parse_search(&output.stdout)
    }

    /// Download `url` into `output_dir`, reporting progress to `sink`.
    pub async fn download(
        &self,
        url: &str,
        format_id: &str,
        media: MediaKind,
        output_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadInfo, MediaError> {
        let args = download_args(url, format_id, media, output_dir);
        let output = run_tool(TOOL, &self.command, &args, parse_progress, sink).await?;
        Ok(parse_download_info(&output.stdout))
    }

    /// Fetch the best audio of `url` as mp3 next to `output`.
    pub async fn download_audio(&self, url: &str, output: &Path) -> Result<(), MediaError> {
        let args = audio_args(url, output);
        run_tool(TOOL, &self.command, &args, |_| None, &Silent).await?;
        Ok(())
    }
}
