use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::ElementRef;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::selectors;
use crate::browser::navigator::{element_text, parse_selector, Cancellation};
use crate::browser::{BrowserSession, PageNavigator, RenderedPage};
use crate::error::ScrapeError;
use crate::models::{FailedVideo, Thumbnails, VideoRecord};
use crate::normalize::{duration_iso, parse_count, parse_duration, parse_relative_date};

static VIDEO_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[?&]v=|/shorts/|youtu\.be/)([A-Za-z0-9_-]{6,20})").expect("video id pattern")
});

/// Consecutive failed scroll rounds before pagination gives up.
const MAX_FAILED_ROUNDS: u32 = 2;

/// Consecutive scroll rounds that rendered nothing new before pagination
/// gives up. Lazy loading can lag a round or two behind the scroll.
const MAX_IDLE_ROUNDS: u32 = 3;

/// Loosely typed fields of one grid item, as rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct RawVideo {
    pub video_id: String,
    pub title: String,
    pub metadata: Vec<String>,
    pub duration: Option<String>,
}

pub fn video_id_from_href(href: &str) -> Option<String> {
    VIDEO_ID_RE
        .captures(href)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Grid items in listing order. An item that cannot be read is an `Err`
/// carrying why, so callers can report it without dropping the rest.
pub fn parse_items(page: &RenderedPage) -> Vec<Result<RawVideo, String>> {
    let (Some(item_sel), Some(link_sel), Some(title_sel), Some(meta_sel), Some(duration_sel)) = (
        parse_selector(selectors::VIDEO_ITEM),
        parse_selector(selectors::VIDEO_LINK),
        parse_selector(selectors::VIDEO_TITLE),
        parse_selector(selectors::VIDEO_METADATA),
        parse_selector(selectors::VIDEO_DURATION),
    ) else {
        return Vec::new();
    };

    page.document()
        .select(&item_sel)
        .map(|item| {
            let video_id = item
                .select(&link_sel)
                .filter_map(|link| link.value().attr("href"))
                .find_map(video_id_from_href)
                .ok_or_else(|| "no video link".to_string())?;

            let title = item
                .select(&title_sel)
                .find_map(|el| title_of(el))
                .ok_or_else(|| format!("no title for {}", video_id))?;

            let metadata = item
                .select(&meta_sel)
                .map(element_text)
                .filter(|text| !text.is_empty())
                .collect();

            let duration = item
                .select(&duration_sel)
                .map(element_text)
                .find(|text| !text.is_empty());

            Ok(RawVideo {
                video_id,
                title,
                metadata,
                duration,
            })
        })
        .collect()
}

fn title_of(element: ElementRef<'_>) -> Option<String> {
    let text = element_text(element);
    if !text.is_empty() {
        return Some(text);
    }
    element
        .value()
        .attr(selectors::VIDEO_TITLE_ATTR)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Whether the listing shows a continuation spinner.
pub fn has_more(page: &RenderedPage) -> bool {
    parse_selector(selectors::CONTINUATION)
        .map(|sel| page.document().select(&sel).next().is_some())
        .unwrap_or(false)
}

/// Accumulates grid items across pagination rounds. Re-rendered items are
/// recognised by id; the listing order of first appearance is kept.
#[derive(Debug)]
pub struct VideoCollector {
    max: usize,
    seen: HashSet<String>,
    videos: Vec<RawVideo>,
    failures: Vec<FailedVideo>,
    total_found: usize,
}

impl VideoCollector {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            seen: HashSet::new(),
            videos: Vec::new(),
            failures: Vec::new(),
            total_found: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.videos.len() >= self.max
    }

    /// Takes one full render of the grid; returns how many new videos were kept.
    pub fn absorb(&mut self, items: Vec<Result<RawVideo, String>>) -> usize {
        self.total_found = self.total_found.max(items.len());
        let mut added = 0;

        for (index, item) in items.into_iter().enumerate() {
            match item {
                Ok(raw) => {
                    // A late render may fix an item that failed earlier
                    self.failures.retain(|f| f.index != index);
                    if self.is_full() || !self.seen.insert(raw.video_id.clone()) {
                        continue;
                    }
                    self.videos.push(raw);
                    added += 1;
                }
                Err(reason) => {
                    if !self.failures.iter().any(|f| f.index == index) {
                        debug!(index, reason = %reason, "grid item unreadable");
                        self.failures.push(FailedVideo { index, reason });
                    }
                }
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }
}

/// Normalized videos plus bookkeeping for the response metadata.
#[derive(Debug)]
pub struct VideoCollection {
    pub videos: Vec<VideoRecord>,
    pub total_found: usize,
    pub failed: Vec<FailedVideo>,
    pub pages_loaded: usize,
}

/// Paginates the listing already loaded in `session` until `max` videos are
/// collected, the page shows no continuation, two scroll rounds in a row fail,
/// or three rounds in a row succeed without yielding anything new.
pub fn collect_videos(
    navigator: &PageNavigator,
    session: &dyn BrowserSession,
    first_page: &RenderedPage,
    max: usize,
    cancel: &Cancellation,
) -> Result<VideoCollection, ScrapeError> {
    let base_url = navigator.config().base_url.as_str();
    let max_rounds = navigator.config().max_pagination_rounds;

    let mut collector = VideoCollector::new(max);
    collector.absorb(parse_items(first_page));
    let mut more = has_more(first_page);
    let mut pages_loaded = 1;
    let mut failed = 0;
    let mut idle = 0;
    let mut rounds = 0;

    while !collector.is_full()
        && more
        && failed < MAX_FAILED_ROUNDS
        && idle < MAX_IDLE_ROUNDS
        && rounds < max_rounds
    {
        cancel.check()?;
        rounds += 1;

        let round = navigator
            .paginate(session)
            .and_then(|_| navigator.capture(session, first_page.url()));
        match round {
            Ok(page) => {
                pages_loaded += 1;
                failed = 0;
                let added = collector.absorb(parse_items(&page));
                more = has_more(&page);
                if added == 0 {
                    idle += 1;
                    debug!(round = rounds, idle, "pagination round added nothing");
                } else {
                    idle = 0;
                }
            }
            Err(e) if e.is_crash() => return Err(ScrapeError::SessionCrashed(e.to_string())),
            Err(e) => {
                failed += 1;
                warn!(round = rounds, failed, "pagination round failed: {}", e);
            }
        }
    }

    if rounds >= max_rounds && more && !collector.is_full() {
        warn!(rounds, collected = collector.len(), "pagination round limit reached");
    }

    let scraped_at = first_page.captured_at();
    let videos: Vec<VideoRecord> = collector
        .videos
        .into_iter()
        .map(|raw| to_record(raw, base_url, scraped_at))
        .collect();

    info!(
        videos = videos.len(),
        found = collector.total_found,
        failed = collector.failures.len(),
        pages = pages_loaded,
        "video listing collected"
    );

    Ok(VideoCollection {
        videos,
        total_found: collector.total_found,
        failed: collector.failures,
        pages_loaded,
    })
}

/// Normalizes one raw item. Unparseable fields become `None`.
pub fn to_record(raw: RawVideo, base_url: &str, scraped_at: DateTime<Utc>) -> VideoRecord {
    let view_count = raw
        .metadata
        .iter()
        .filter(|text| text.to_lowercase().contains("view"))
        .find_map(|text| parse_count(text));
    let published_at = raw
        .metadata
        .iter()
        .find_map(|text| parse_relative_date(text, scraped_at));
    let duration_seconds = raw.duration.as_deref().and_then(parse_duration);
    let thumbnails = Thumbnails::for_video(&raw.video_id);

    VideoRecord {
        url: format!("{}/watch?v={}", base_url, raw.video_id),
        thumbnail_url: thumbnails.high.url.clone(),
        thumbnails,
        duration: duration_seconds.map(duration_iso),
        duration_seconds,
        view_count,
        published_at,
        title: raw.title,
        video_id: raw.video_id,
    }
}
