//! Job handlers.
//!
//! One [`JobHandler`] per job kind, looked up through the [`HandlerRegistry`].

pub mod download;
pub mod handler;
pub mod registry;
pub mod separation;

pub use download::DownloadHandler;
pub use handler::JobHandler;
pub use registry::HandlerRegistry;
pub use separation::{KaraokeHandler, Separator, StemsHandler};

use std::sync::Arc;

use crate::media::MediaTools;

/// Register the download, stems and karaoke handlers backed by `tools`.
pub fn register_builtin_handlers(registry: &HandlerRegistry, tools: &MediaTools) {
    let separator = Separator::new(tools.ytdlp.clone(), tools.demucs.clone());

    registry.register_sync(Arc::new(DownloadHandler::new(
        tools.ytdlp.clone(),
        tools.spotdl.clone(),
    )));
    registry.register_sync(Arc::new(StemsHandler::new(separator.clone())));
    registry.register_sync(Arc::new(KaraokeHandler::new(separator)));

    tracing::info!("Registered 3 job handlers");
}
