//! Turning rendered pages into typed records.

pub mod channel;
pub mod selectors;
pub mod video;

pub use channel::{extract_channel, merge_about, needs_about};
pub use video::{collect_videos, VideoCollection};
