//! YTDLStem: media download, stem separation and karaoke job service.

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod media;
pub mod worker;
