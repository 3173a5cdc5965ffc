use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;
use utoipa::ToSchema;

use crate::config::ScrapeConfig;
use crate::error::ScrapeError;

static HANDLE_URL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.|m\.)?youtube\.com/").expect("handle prefix pattern")
});

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{3,30}$").expect("handle pattern"));

// ============================================================================
// Request
// ============================================================================

/// Body of `POST /scrape`.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ScrapeRequestBody {
    /// Channel handle, with or without the leading `@`
    #[schema(example = "@example")]
    pub channel_handle: String,
    /// Maximum number of videos to return (default 100)
    pub max_videos: Option<i64>,
}

/// Canonical channel handle, always stored with a leading `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle(String);

impl ChannelHandle {
    /// Accepts `example`, `@example`, or a channel URL such as
    /// `https://www.youtube.com/@example/videos`.
    pub fn parse(raw: &str) -> Result<Self, ScrapeError> {
        let trimmed = raw.trim();
        let without_prefix = HANDLE_URL_PREFIX.replace(trimmed, "");
        let first_segment = without_prefix
            .split(|c| c == '/' || c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        let name = first_segment.strip_prefix('@').unwrap_or(first_segment);

        if !HANDLE_RE.is_match(name) {
            return Err(ScrapeError::InvalidRequest(format!(
                "'{}' is not a valid channel handle",
                raw.trim()
            )));
        }
        Ok(Self(format!("@{}", name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn videos_url(&self, base_url: &str) -> String {
        format!("{}/{}/videos", base_url, self.0)
    }

    pub fn about_url(&self, base_url: &str) -> String {
        format!("{}/{}/about", base_url, self.0)
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated scrape request.
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub handle: ChannelHandle,
    pub max_videos: usize,
}

impl ScrapeRequest {
    pub fn from_body(body: ScrapeRequestBody, config: &ScrapeConfig) -> Result<Self, ScrapeError> {
        let handle = ChannelHandle::parse(&body.channel_handle)?;

        let max_videos = match body.max_videos {
            None => config.default_max_videos,
            Some(n) if n <= 0 => {
                return Err(ScrapeError::InvalidRequest(
                    "max_videos must be a positive integer".to_string(),
                ))
            }
            Some(n) => {
                let requested = usize::try_from(n).unwrap_or(usize::MAX);
                if requested > config.max_videos_ceiling {
                    info!(
                        requested,
                        ceiling = config.max_videos_ceiling,
                        "max_videos capped at ceiling"
                    );
                }
                requested.min(config.max_videos_ceiling)
            }
        };

        Ok(Self { handle, max_videos })
    }
}

// ============================================================================
// Records
// ============================================================================

/// Channel metadata. Counts are `null` when they could not be read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub title: String,
    pub handle: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub banner_url: Option<String>,
    pub subscriber_count: Option<u64>,
    pub view_count: Option<u64>,
    pub video_count: Option<u64>,
    pub country: Option<String>,
    pub joined_at: Option<NaiveDate>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Thumbnail {
    pub url: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Thumbnails {
    pub default: Thumbnail,
    pub medium: Thumbnail,
    pub high: Thumbnail,
}

impl Thumbnails {
    /// The platform CDN serves fixed renditions for every video id.
    pub fn for_video(video_id: &str) -> Self {
        let at = |name: &str, width, height| Thumbnail {
            url: format!("https://i.ytimg.com/vi/{}/{}.jpg", video_id, name),
            width,
            height,
        };
        Self {
            default: at("default", 120, 90),
            medium: at("mqdefault", 320, 180),
            high: at("hqdefault", 480, 360),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VideoRecord {
    pub video_id: String,
    pub title: String,
    pub url: String,
    pub view_count: Option<u64>,
    pub duration_seconds: Option<u64>,
    /// ISO-8601 form of `duration_seconds`, e.g. `PT5M36S`
    pub duration: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub thumbnail_url: String,
    pub thumbnails: Thumbnails,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FailedVideo {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ScrapeMetadata {
    pub total_videos_found: usize,
    pub videos_processed: usize,
    pub videos_failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_videos: Vec<FailedVideo>,
    pub pages_loaded: usize,
    pub scraped_at: DateTime<Utc>,
}

/// What `POST /scrape` returns on success.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ScrapeResult {
    pub channel: ChannelRecord,
    pub videos: Vec<VideoRecord>,
    pub metadata: ScrapeMetadata,
}
