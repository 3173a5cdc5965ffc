//! Canonicalization of loosely formatted scraped text.
//!
//! Every function here is total: malformed input yields `None` /
//! [`Normalized::Unavailable`], never a panic or an error, so one bad field
//! cannot abort the rest of a record.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s?([KMB])?\b").expect("count pattern")
});

static NO_COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*no\s+(views?|subscribers?|videos?)\b").expect("no-count pattern")
});

static RELATIVE_DATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+)\s+([a-z]+?)s?\s+ago\b").expect("relative date pattern")
});

/// What a raw field is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `1.2M`, `340K subscribers`, `1,234 views`
    Count,
    /// `H:MM:SS` or `MM:SS`
    Duration,
    /// `3 days ago`
    RelativeDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Count(u64),
    Seconds(u64),
    Timestamp(DateTime<Utc>),
    Unavailable,
}

impl Normalized {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Normalized::Unavailable)
    }
}

/// Dispatches on `kind`. Relative dates are resolved against `scraped_at`.
pub fn normalize(raw: &str, kind: FieldKind, scraped_at: DateTime<Utc>) -> Normalized {
    let value = match kind {
        FieldKind::Count => parse_count(raw).map(Normalized::Count),
        FieldKind::Duration => parse_duration(raw).map(Normalized::Seconds),
        FieldKind::RelativeDate => parse_relative_date(raw, scraped_at).map(Normalized::Timestamp),
    };
    value.unwrap_or(Normalized::Unavailable)
}

/// Suffix multiplier table.
fn multiplier(suffix: Option<&str>) -> Option<f64> {
    match suffix.map(|s| s.to_ascii_uppercase()) {
        None => Some(1.0),
        Some(s) => match s.as_str() {
            "K" => Some(1e3),
            "M" => Some(1e6),
            "B" => Some(1e9),
            _ => None,
        },
    }
}

/// Turns `1.2M subscribers` into `1_200_000`. `No views` counts as zero.
pub fn parse_count(raw: &str) -> Option<u64> {
    if NO_COUNT_RE.is_match(raw) {
        return Some(0);
    }

    let caps = COUNT_RE.captures(raw)?;
    let base: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let value = (base * multiplier(caps.get(2).map(|m| m.as_str()))?).round();

    if value.is_finite() && value >= 0.0 && value <= u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}

/// `45:10` -> 2710, `1:02:03` -> 3723. Minutes and seconds after the leading
/// component must be below 60.
pub fn parse_duration(raw: &str) -> Option<u64> {
    let parts: Vec<&str> = raw.trim().split(':').map(str::trim).collect();
    if !(2..=3).contains(&parts.len()) {
        return None;
    }

    let mut numbers = Vec::with_capacity(parts.len());
    for part in &parts {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        numbers.push(part.parse::<u64>().ok()?);
    }

    if numbers[1..].iter().any(|n| *n >= 60) {
        return None;
    }

    Some(numbers.iter().fold(0u64, |acc, n| acc * 60 + n))
}

/// Best-effort timestamp for texts like `3 weeks ago` or `Streamed 2 hours ago`.
/// Months are taken as 30 days and years as 365. Unknown units are not guessed.
pub fn parse_relative_date(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RELATIVE_DATE_RE.captures(raw)?;
    let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();

    let delta = match unit.as_str() {
        "second" => TimeDelta::try_seconds(amount),
        "minute" => TimeDelta::try_minutes(amount),
        "hour" => TimeDelta::try_hours(amount),
        "day" => TimeDelta::try_days(amount),
        "week" => TimeDelta::try_weeks(amount),
        "month" => amount.checked_mul(30).and_then(TimeDelta::try_days),
        "year" => amount.checked_mul(365).and_then(TimeDelta::try_days),
        _ => None,
    }?;

    now.checked_sub_signed(delta)
}

/// ISO-8601 duration, e.g. 3723 -> `PT1H2M3S`.
pub fn duration_iso(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    out.push_str(&format!("{}S", seconds));
    out
}

/// `Joined Jan 1, 2022` -> 2022-01-01
pub fn parse_joined_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let date = trimmed
        .strip_prefix("Joined")
        .unwrap_or(trimmed)
        .trim();
    NaiveDate::parse_from_str(date, "%b %d, %Y")
        .or_else(|_| NaiveDate::parse_from_str(date, "%B %d, %Y"))
        .ok()
}
