use serde_json::Value;
use tracing::{debug, warn};

use super::selectors::{self, FieldSpec};
use crate::browser::navigator::{element_text, json_text, parse_selector};
use crate::browser::RenderedPage;
use crate::error::ScrapeError;
use crate::models::{ChannelHandle, ChannelRecord};
use crate::normalize::{parse_count, parse_joined_date};

/// Channel header fields from the channel's videos tab.
///
/// `channel_id` and `title` are required: if either is missing the whole
/// request fails with the set of missing names and no partial record is built.
/// Everything else is optional and left `None` when absent.
pub fn extract_channel(
    page: &RenderedPage,
    handle: &ChannelHandle,
) -> Result<ChannelRecord, ScrapeError> {
    let channel_id = page.extract_field(&selectors::CHANNEL_ID);
    let title = page.extract_field(&selectors::TITLE);

    let (channel_id, title) = match (channel_id, title) {
        (Some(channel_id), Some(title)) => (channel_id, title),
        (channel_id, title) => {
            if let Some(message) = page.extract_field(&selectors::NOT_FOUND) {
                return Err(ScrapeError::ChannelNotFound(format!("{}: {}", handle, message)));
            }
            let missing = [
                (selectors::CHANNEL_ID, channel_id.is_none()),
                (selectors::TITLE, title.is_none()),
            ]
            .into_iter()
            .filter(|(_, missing)| *missing)
            .map(|(spec, _)| spec.name);
            let err = ScrapeError::missing_fields(missing);
            warn!(url = page.url(), handle = %handle, "required channel fields missing: {}", err);
            return Err(err);
        }
    };

    let count = |spec: &FieldSpec| {
        let raw = page.extract_field(spec)?;
        let value = parse_count(&raw);
        if value.is_none() {
            debug!(field = spec.name, raw = %raw, "count not parseable");
        }
        value
    };

    let record = ChannelRecord {
        channel_id,
        title,
        handle: Some(
            page.extract_field(&selectors::VANITY_URL)
                .and_then(|raw| handle_from_vanity(&raw))
                .unwrap_or_else(|| handle.as_str().to_string()),
        ),
        description: page.extract_field(&selectors::DESCRIPTION),
        avatar_url: page.extract_field(&selectors::AVATAR_URL),
        banner_url: page.extract_field(&selectors::BANNER_URL),
        subscriber_count: count(&selectors::SUBSCRIBER_COUNT),
        view_count: None,
        video_count: count(&selectors::VIDEO_COUNT),
        country: None,
        joined_at: None,
        keywords: page
            .extract_field(&selectors::KEYWORDS)
            .map(|raw| split_keywords(&raw))
            .unwrap_or_default(),
    };

    debug!(
        channel_id = %record.channel_id,
        subscribers = ?record.subscriber_count,
        "channel header extracted"
    );
    Ok(record)
}

/// Whether the about page could fill anything the header lacked.
pub fn needs_about(record: &ChannelRecord) -> bool {
    record.view_count.is_none()
        || record.subscriber_count.is_none()
        || record.video_count.is_none()
        || record.joined_at.is_none()
        || record.country.is_none()
}

#[derive(Debug, Default, PartialEq)]
struct AboutStats {
    subscribers: Option<String>,
    views: Option<String>,
    videos: Option<String>,
    joined: Option<String>,
    country: Option<String>,
}

impl AboutStats {
    fn or(self, other: AboutStats) -> AboutStats {
        AboutStats {
            subscribers: self.subscribers.or(other.subscribers),
            views: self.views.or(other.views),
            videos: self.videos.or(other.videos),
            joined: self.joined.or(other.joined),
            country: self.country.or(other.country),
        }
    }
}

/// Fills fields still missing on `record` from the about page. Values the
/// header already supplied are kept. Returns how many fields were filled.
pub fn merge_about(record: &mut ChannelRecord, page: &RenderedPage) -> usize {
    let stats = about_rows_dom(page).or(about_rows_json(page));
    let mut filled = 0;

    let mut fill = |slot: &mut Option<u64>, raw: &Option<String>| {
        if slot.is_none() {
            if let Some(value) = raw.as_deref().and_then(parse_count) {
                *slot = Some(value);
                filled += 1;
            }
        }
    };
    fill(&mut record.subscriber_count, &stats.subscribers);
    fill(&mut record.view_count, &stats.views);
    fill(&mut record.video_count, &stats.videos);

    if record.joined_at.is_none() {
        if let Some(joined) = stats.joined.as_deref().and_then(parse_joined_date) {
            record.joined_at = Some(joined);
            filled += 1;
        }
    }
    if record.country.is_none() && stats.country.is_some() {
        record.country = stats.country;
        filled += 1;
    }

    debug!(url = page.url(), filled, "about page merged");
    filled
}

/// Current layout: a table of rows, each tagged by an icon name.
fn about_rows_dom(page: &RenderedPage) -> AboutStats {
    let mut stats = AboutStats::default();
    let (Some(row_sel), Some(icon_sel), Some(value_sel)) = (
        parse_selector(selectors::ABOUT_ROW),
        parse_selector(selectors::ABOUT_ROW_ICON),
        parse_selector(selectors::ABOUT_ROW_VALUE),
    ) else {
        return stats;
    };

    for row in page.document().select(&row_sel) {
        let Some(icon) = row.select(&icon_sel).next().and_then(|el| el.value().attr("icon")) else {
            continue;
        };
        let Some(value) = row
            .select(&value_sel)
            .next()
            .map(element_text)
            .filter(|text| !text.is_empty())
        else {
            continue;
        };

        let slot = match icon {
            selectors::ICON_SUBSCRIBERS => &mut stats.subscribers,
            selectors::ICON_VIEWS => &mut stats.views,
            selectors::ICON_VIDEOS => &mut stats.videos,
            selectors::ICON_JOINED => &mut stats.joined,
            selectors::ICON_COUNTRY => &mut stats.country,
            _ => continue,
        };
        slot.get_or_insert(value);
    }
    stats
}

/// Older layout: `metadataRowRenderer` objects titled by what they hold.
fn about_rows_json(page: &RenderedPage) -> AboutStats {
    let mut stats = AboutStats::default();
    let Some(data) = page.initial_data() else {
        return stats;
    };

    let mut rows = Vec::new();
    collect_keyed(data, selectors::ABOUT_JSON_ROW, &mut rows);

    for row in rows {
        let title = row.get("title").and_then(json_text).unwrap_or_default().to_lowercase();
        let Some(value) = row.pointer("/contents/0").and_then(json_text) else {
            continue;
        };
        let slot = if title.contains("joined") {
            &mut stats.joined
        } else if title.contains("view") {
            &mut stats.views
        } else if title.contains("subscriber") {
            &mut stats.subscribers
        } else if title.contains("video") {
            &mut stats.videos
        } else if title.contains("location") || title.contains("country") {
            &mut stats.country
        } else {
            continue;
        };
        slot.get_or_insert(value);
    }
    stats
}

/// Every object stored under `key` anywhere in `value`, in document order.
fn collect_keyed<'a>(value: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == key {
                    out.push(v);
                } else {
                    collect_keyed(v, key, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_keyed(item, key, out);
            }
        }
        _ => {}
    }
}

/// `http://www.youtube.com/@example` -> `@example`
fn handle_from_vanity(raw: &str) -> Option<String> {
    raw.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| segment.starts_with('@') && segment.len() > 1)
        .map(str::to_string)
}

/// Space separated, with multi-word keywords in double quotes.
fn split_keywords(raw: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in raw.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    keywords.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        keywords.push(current.trim().to_string());
    }
    keywords
}
