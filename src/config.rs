//! Configuration types.
//!
//! Everything is read once at startup from the process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Job queue and retention settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent worker loops.
    pub max_workers: usize,
    /// How long terminal jobs (and their files) are kept.
    pub retention: Duration,
    /// How often the reaper sweeps.
    pub cleanup_interval: Duration,
    /// Root directory holding one output directory per job.
    pub temp_dir: PathBuf,
    /// How long shutdown waits for in-flight handlers before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            retention: Duration::from_secs(1800), // 30 min
            cleanup_interval: Duration::from_secs(300), // 5 min
            temp_dir: PathBuf::from("/tmp/ytdlstem"),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Command lines used by the media handlers: program followed by leading arguments.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub ytdlp: Vec<String>,
    pub spotdl: Vec<String>,
    /// Demucs is usually launched through python.
    pub demucs: Vec<String>,
    pub ffmpeg: Vec<String>,
}

fn words(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ytdlp: words("yt-dlp"),
            spotdl: words("spotdl"),
            demucs: words("python -m demucs"),
            ffmpeg: words("ffmpeg"),
        }
    }
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    /// Origin of the web frontend, allowed by CORS.
    pub frontend_url: String,
    /// Maximum multipart upload size in bytes.
    pub max_upload_bytes: usize,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub queue: QueueConfig,
    pub tools: ToolPaths,
    /// Settings that failed to parse while loading.
    pub rejected: Vec<RejectedSetting>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8000,
            frontend_url: "http://localhost:3000".to_string(),
            max_upload_bytes: 200 * 1024 * 1024,
            log_dir: None,
            queue: QueueConfig::default(),
            tools: ToolPaths::default(),
            rejected: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Malformed values fall back to their defaults and are listed in
    /// [`Config::rejected`] so the caller can report them once logging is up.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut numbers = NumberReader {
            lookup: &lookup,
            rejected: Vec::new(),
        };

        let queue = QueueConfig {
            max_workers: numbers
                .parse_or("MAX_WORKERS", defaults.queue.max_workers)
                .max(1),
            retention: Duration::from_secs(
                numbers.parse_or("CLEANUP_AFTER", defaults.queue.retention.as_secs()),
            ),
            cleanup_interval: Duration::from_secs(
                numbers
                    .parse_or("CLEANUP_INTERVAL", defaults.queue.cleanup_interval.as_secs())
                    .max(1),
            ),
            temp_dir: text("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.queue.temp_dir),
            shutdown_grace: Duration::from_secs(
                numbers.parse_or("SHUTDOWN_GRACE_SECS", defaults.queue.shutdown_grace.as_secs()),
            ),
        };

        let command = |key: &str| text(key).map(|v| words(&v));
        let tools = ToolPaths {
            ytdlp: command("YTDLP_BIN").unwrap_or(defaults.tools.ytdlp),
            spotdl: command("SPOTDL_BIN").unwrap_or(defaults.tools.spotdl),
            demucs: command("DEMUCS_BIN").unwrap_or(defaults.tools.demucs),
            ffmpeg: command("FFMPEG_BIN").unwrap_or(defaults.tools.ffmpeg),
        };

        let upload_mb: usize = numbers.parse_or("MAX_UPLOAD_MB", 200);
        let host = numbers.parse_or("HOST", defaults.host);
        let port = numbers.parse_or("PORT", defaults.port);

        Self {
            host,
            port,
            frontend_url: text("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            max_upload_bytes: upload_mb.saturating_mul(1024 * 1024),
            log_dir: text("LOG_DIR").map(PathBuf::from),
            queue,
            tools,
            rejected: numbers.rejected,
        }
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// A setting that was present but unparseable; its default was used instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSetting {
    pub key: String,
    pub value: String,
}

struct NumberReader<'a, F> {
    lookup: &'a F,
    rejected: Vec<RejectedSetting>,
}

impl<F> NumberReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse_or<T: FromStr>(&mut self, key: &str, default: T) -> T {
        match (self.lookup)(key) {
            Some(raw) if !raw.trim().is_empty() => match raw.trim().parse() {
                Ok(value) => value,
                Err(_) => {
                    self.rejected.push(RejectedSetting {
                        key: key.to_string(),
                        value: raw,
                    });
                    default
                }
            },
            _ => default,
        }
    }
}
