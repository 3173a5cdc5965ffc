//! Where each field lives on the rendered pages.
//!
//! The platform's markup is an unversioned contract. Candidates are tried in
//! order, the embedded `ytInitialData` first and the DOM second, so a layout
//! change usually means editing a table here and nothing else.

/// One way of locating a raw value on a [`RenderedPage`](crate::browser::RenderedPage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSelector {
    /// JSON pointer into `ytInitialData`
    Json(&'static str),
    /// Text content of the first matching element with non-empty text
    Css(&'static str),
    /// Attribute of the first matching element carrying it
    CssAttr(&'static str, &'static str),
}

/// A named field and its candidate locations, most reliable first.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub candidates: &'static [FieldSelector],
}

use FieldSelector::{Css, CssAttr, Json};

macro_rules! channel_meta {
    ($field:literal) => {
        concat!("/metadata/channelMetadataRenderer/", $field)
    };
}

macro_rules! c4_header {
    ($field:literal) => {
        concat!("/header/c4TabbedHeaderRenderer/", $field)
    };
}

// ============================================================================
// Channel header
// ============================================================================

pub const CHANNEL_ID: FieldSpec = FieldSpec {
    name: "channel_id",
    candidates: &[
        Json(channel_meta!("externalId")),
        Json(c4_header!("channelId")),
        CssAttr("meta[itemprop='identifier']", "content"),
        CssAttr("meta[itemprop='channelId']", "content"),
    ],
};

pub const TITLE: FieldSpec = FieldSpec {
    name: "title",
    candidates: &[
        Json(channel_meta!("title")),
        Json(c4_header!("title")),
        CssAttr("meta[property='og:title']", "content"),
        Css("#channel-name #text"),
        Css("yt-dynamic-text-view-model h1"),
    ],
};

pub const DESCRIPTION: FieldSpec = FieldSpec {
    name: "description",
    candidates: &[
        Json(channel_meta!("description")),
        CssAttr("meta[property='og:description']", "content"),
        CssAttr("meta[name='description']", "content"),
    ],
};

pub const AVATAR_URL: FieldSpec = FieldSpec {
    name: "avatar_url",
    candidates: &[
        Json(channel_meta!("avatar/thumbnails/0/url")),
        Json(c4_header!("avatar/thumbnails/0/url")),
        CssAttr("#avatar img", "src"),
        CssAttr("meta[property='og:image']", "content"),
    ],
};

pub const BANNER_URL: FieldSpec = FieldSpec {
    name: "banner_url",
    candidates: &[
        Json(c4_header!("banner/thumbnails/0/url")),
        CssAttr("yt-image-banner-view-model img", "src"),
        CssAttr("#banner img", "src"),
    ],
};

pub const VANITY_URL: FieldSpec = FieldSpec {
    name: "handle",
    candidates: &[
        Json(channel_meta!("vanityChannelUrl")),
        Json(c4_header!("channelHandleText")),
        Css("#channel-handle"),
    ],
};

pub const KEYWORDS: FieldSpec = FieldSpec {
    name: "keywords",
    candidates: &[
        Json(channel_meta!("keywords")),
        CssAttr("meta[name='keywords']", "content"),
    ],
};

pub const SUBSCRIBER_COUNT: FieldSpec = FieldSpec {
    name: "subscriber_count",
    candidates: &[
        Json(c4_header!("subscriberCountText")),
        Css("#subscriber-count"),
    ],
};

pub const VIDEO_COUNT: FieldSpec = FieldSpec {
    name: "video_count",
    candidates: &[Json(c4_header!("videosCountText")), Css("#videos-count")],
};

/// Error panel shown for handles that do not resolve to a channel.
pub const NOT_FOUND: FieldSpec = FieldSpec {
    name: "not_found",
    candidates: &[
        Json("/alerts/0/alertRenderer/text"),
        Css("yt-page-empty-state-view-model"),
        Css("#error-page #subreason"),
    ],
};

// ============================================================================
// About page
// ============================================================================

/// Rows of the "more about this channel" table, one stat per row, each
/// tagged with an icon.
pub const ABOUT_ROW: &str = "#additional-info-container tr";
pub const ABOUT_ROW_ICON: &str = "yt-icon[icon]";
pub const ABOUT_ROW_VALUE: &str = "td:last-child";

pub const ICON_SUBSCRIBERS: &str = "person_radar";
pub const ICON_VIEWS: &str = "trending_up";
pub const ICON_VIDEOS: &str = "my_videos";
pub const ICON_JOINED: &str = "info_outline";
pub const ICON_COUNTRY: &str = "privacy_public";

/// Key of the row objects in the older JSON layout of the about tab.
pub const ABOUT_JSON_ROW: &str = "metadataRowRenderer";

// ============================================================================
// Video grid
// ============================================================================

pub const VIDEO_ITEM: &str = "ytd-rich-item-renderer, ytd-grid-video-renderer";
pub const VIDEO_LINK: &str = "a#video-title-link, a#thumbnail";
pub const VIDEO_TITLE: &str = "#video-title";
pub const VIDEO_TITLE_ATTR: &str = "title";
pub const VIDEO_METADATA: &str = "#metadata-line span";
pub const VIDEO_DURATION: &str =
    "span#text.ytd-thumbnail-overlay-time-status-renderer, badge-shape .badge-shape-wiz__text";

/// Spinner rendered at the end of the grid while more items can load.
pub const CONTINUATION: &str = "ytd-continuation-item-renderer";
