//! Source platform detection for URLs and free-text queries.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static YOUTUBE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://(www\.)?(youtube\.com|youtu\.be|music\.youtube\.com)").expect("valid regex")
});
static SPOTIFY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://(open\.)?spotify\.com").expect("valid regex"));
static SOUNDCLOUD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://(www\.|m\.)?soundcloud\.com").expect("valid regex"));

/// Where a URL points, or `Search` for plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Youtube,
    Spotify,
    Soundcloud,
    /// Some other http(s) URL; yt-dlp gets a try.
    Unknown,
    /// Not a URL at all.
    Search,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Spotify => "spotify",
            Self::Soundcloud => "soundcloud",
            Self::Unknown => "unknown",
            Self::Search => "search",
        }
    }

    /// Whether the input was a URL at all.
    pub fn is_url(&self) -> bool {
        *self != Self::Search
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a URL or search query.
pub fn detect_platform(url_or_query: &str) -> Platform {
    let text = url_or_query.trim();
    if YOUTUBE.is_match(text) {
        Platform::Youtube
    } else if SPOTIFY.is_match(text) {
        Platform::Spotify
    } else if SOUNDCLOUD.is_match(text) {
        Platform::Soundcloud
    } else if text.starts_with("http://") || text.starts_with("https://") {
        Platform::Unknown
    } else {
        Platform::Search
    }
}
