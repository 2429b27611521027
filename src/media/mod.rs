//! Media collaborators: wrappers around yt-dlp, spotdl, Demucs and ffmpeg.
//!
//! Every tool runs as a child process through [`process::run_tool`], so no
//! media work ever blocks the runtime threads.

pub mod demucs;
pub mod platform;
pub mod process;
pub mod spotdl;
pub mod ytdlp;

pub use demucs::Demucs;
pub use platform::{Platform, detect_platform};
pub use process::{Progress, ProgressSink};
pub use spotdl::SpotDl;
pub use ytdlp::YtDlp;

use crate::config::ToolPaths;

/// The configured set of external tools.
#[derive(Debug, Clone)]
pub struct MediaTools {
    pub ytdlp: YtDlp,
    pub spotdl: SpotDl,
    pub demucs: Demucs,
}

impl MediaTools {
    pub fn new(paths: &ToolPaths) -> Self {
        Self {
            ytdlp: YtDlp::new(paths.ytdlp.clone()),
            spotdl: SpotDl::new(paths.spotdl.clone()),
            demucs: Demucs::new(paths.demucs.clone(), paths.ffmpeg.clone()),
        }
    }
}
