//! Job record, typed requests and handler outputs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::media::Platform;
use crate::worker::state::JobStatus;

/// Upper bound on a failure description stored in `Job::message`.
pub const MAX_MESSAGE_LEN: usize = 500;

/// Which handler applies to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Stems,
    Karaoke,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Download => "download",
            Self::Stems => "stems",
            Self::Karaoke => "karaoke",
        };
        write!(f, "{s}")
    }
}

/// Video or audio-only download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

/// Container for separated audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp3,
    Wav,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "wav" => Ok(Self::Wav),
            other => Err(format!("Unsupported output format: {other}")),
        }
    }
}

/// Which stems a separation job keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StemSelection {
    #[default]
    All,
    Vocals,
    Drums,
    Bass,
    Other,
}

impl StemSelection {
    /// Whether the named demucs stem is part of this selection.
    pub fn includes(&self, stem: &str) -> bool {
        match self {
            Self::All => true,
            Self::Vocals => stem == "vocals",
            Self::Drums => stem == "drums",
            Self::Bass => stem == "bass",
            Self::Other => stem == "other",
        }
    }
}

impl std::str::FromStr for StemSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "vocals" => Ok(Self::Vocals),
            "drums" => Ok(Self::Drums),
            "bass" => Ok(Self::Bass),
            "other" => Ok(Self::Other),
            other => Err(format!("Unknown stem selection: {other}")),
        }
    }
}

/// Where a separation job gets its input audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AudioSource {
    /// Bytes uploaded with the request, staged as `input_<file_name>` in the output directory.
    Upload { file_name: String },
    /// Audio fetched by the handler before separating.
    Remote { url: String },
}

impl AudioSource {
    /// Path of the staged input file for this source inside `output_dir`.
    pub fn input_path(&self, output_dir: &Path) -> PathBuf {
        match self {
            Self::Upload { file_name } => output_dir.join(format!("input_{file_name}")),
            Self::Remote { .. } => output_dir.join("input_audio.mp3"),
        }
    }
}

/// Typed job parameters, decoded once at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobRequest {
    Download {
        url: String,
        format_id: String,
        media: MediaKind,
        platform: Platform,
    },
    Stems {
        source: AudioSource,
        output_format: OutputFormat,
        stems: StemSelection,
    },
    Karaoke {
        source: AudioSource,
        output_format: OutputFormat,
    },
}

impl JobRequest {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Download { .. } => JobKind::Download,
            Self::Stems { .. } => JobKind::Stems,
            Self::Karaoke { .. } => JobKind::Karaoke,
        }
    }
}

/// Descriptive tags of a downloaded track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration: Option<f64>,
}

/// What a handler produced. File names are relative to the job's output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Download {
        filename: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<TrackMetadata>,
    },
    Stems {
        stems: BTreeMap<String, String>,
        format: String,
    },
    Karaoke {
        tracks: BTreeMap<String, String>,
        format: String,
    },
}

/// A single admitted unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobKind,
    pub params: JobRequest,
    pub status: JobStatus,
    /// Percentage in [0, 100].
    pub progress: f32,
    pub message: String,
    /// Set only once the job is `Done`.
    pub result: Option<JobOutput>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_dir: PathBuf,
    /// Admission order, used to break `created_at` ties.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Job {
    pub(crate) fn new(id: Uuid, seq: u64, params: JobRequest, output_dir: PathBuf) -> Self {
        Self {
            id,
            job_type: params.kind(),
            params,
            status: JobStatus::Queued,
            progress: 0.0,
            message: String::new(),
            result: None,
            created_at: Utc::now(),
            completed_at: None,
            output_dir,
            seq,
        }
    }

    /// Transition to a new status, stamping `completed_at` on terminal states.
    pub fn transition_to(&mut self, status: JobStatus, message: impl Into<String>) -> Result<(), String> {
        if !self.status.can_transition_to(status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, status
            ));
        }

        self.status = status;
        self.message = message.into();
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a successful handler run.
    pub fn complete(&mut self, output: JobOutput) -> Result<(), String> {
        self.transition_to(JobStatus::Done, "Complete!")?;
        self.progress = 100.0;
        self.result = Some(output);
        Ok(())
    }

    /// Record a failure; the description is cut to [`MAX_MESSAGE_LEN`].
    pub fn fail(&mut self, reason: &str) -> Result<(), String> {
        self.transition_to(JobStatus::Error, truncate(reason, MAX_MESSAGE_LEN))
    }

    /// Whether the retention window has elapsed since completion.
    pub fn is_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        match self.completed_at {
            Some(done) if self.status.is_terminal() => now - done > retention,
            _ => false,
        }
    }
}

/// Truncate to at most `max` characters, on a char boundary.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
