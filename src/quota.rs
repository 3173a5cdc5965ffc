//! Per-key request accounting.
//!
//! Windows are fixed and anchored at first use: the daily window starts with
//! the first request after the previous one elapsed and lasts 24h, the minute
//! window likewise lasts 60s. Both limits are checked before either counter is
//! incremented, under the key's own lock, so a check-then-increment is one
//! indivisible step per key while distinct keys never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::QuotaConfig;

pub const DAY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaReason {
    DailyLimit,
    MinuteLimit,
    UnknownKey,
}

impl QuotaReason {
    pub fn code(&self) -> &'static str {
        match self {
            QuotaReason::DailyLimit => "daily_limit",
            QuotaReason::MinuteLimit => "minute_limit",
            QuotaReason::UnknownKey => "unknown_key",
        }
    }
}

impl fmt::Display for QuotaReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed {
        remaining_day: u32,
        remaining_minute: u32,
    },
    Denied {
        reason: QuotaReason,
        retry_after: Duration,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed { .. })
    }
}

/// Usage state of one API key.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key: String,
    pub owner: String,
    pub day_count: u32,
    pub minute_count: u32,
    pub day_started: Option<Instant>,
    pub minute_started: Option<Instant>,
}

impl ApiKeyRecord {
    fn new(key: String, owner: String) -> Self {
        Self {
            key,
            owner,
            day_count: 0,
            minute_count: 0,
            day_started: None,
            minute_started: None,
        }
    }

    fn roll_windows(&mut self, now: Instant) {
        if window_elapsed(self.day_started, DAY_WINDOW, now) {
            self.day_started = Some(now);
            self.day_count = 0;
        }
        if window_elapsed(self.minute_started, MINUTE_WINDOW, now) {
            self.minute_started = Some(now);
            self.minute_count = 0;
        }
    }
}

fn window_elapsed(started: Option<Instant>, length: Duration, now: Instant) -> bool {
    match started {
        Some(start) => now.saturating_duration_since(start) >= length,
        None => true,
    }
}

fn remaining_in(started: Option<Instant>, length: Duration, now: Instant) -> Duration {
    started
        .map(|start| length.saturating_sub(now.saturating_duration_since(start)))
        .unwrap_or(length)
}

/// Process-wide quota store. The key set is fixed at construction, so lookups
/// need no outer lock; each record sits behind its own mutex.
pub struct QuotaStore {
    limits: QuotaConfig,
    records: HashMap<String, Mutex<ApiKeyRecord>>,
}

impl QuotaStore {
    pub fn new<I>(limits: QuotaConfig, keys: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let records = keys
            .into_iter()
            .map(|(key, owner)| (key.clone(), Mutex::new(ApiKeyRecord::new(key, owner))))
            .collect();
        Self { limits, records }
    }

    pub fn limits(&self) -> &QuotaConfig {
        &self.limits
    }

    pub fn check_and_increment(&self, key: &str) -> QuotaDecision {
        self.check_and_increment_at(key, Instant::now())
    }

    /// Same as [`check_and_increment`](Self::check_and_increment) with an explicit clock.
    pub fn check_and_increment_at(&self, key: &str, now: Instant) -> QuotaDecision {
        let Some(slot) = self.records.get(key) else {
            return QuotaDecision::Denied {
                reason: QuotaReason::UnknownKey,
                retry_after: Duration::ZERO,
            };
        };

        let mut record = lock(slot);
        record.roll_windows(now);

        if record.day_count >= self.limits.daily_limit {
            let retry_after = remaining_in(record.day_started, DAY_WINDOW, now);
            debug!(owner = %record.owner, count = record.day_count, "daily quota exhausted");
            return QuotaDecision::Denied {
                reason: QuotaReason::DailyLimit,
                retry_after,
            };
        }
        if record.minute_count >= self.limits.minute_limit {
            let retry_after = remaining_in(record.minute_started, MINUTE_WINDOW, now);
            debug!(owner = %record.owner, count = record.minute_count, "minute quota exhausted");
            return QuotaDecision::Denied {
                reason: QuotaReason::MinuteLimit,
                retry_after,
            };
        }

        record.day_count += 1;
        record.minute_count += 1;

        QuotaDecision::Allowed {
            remaining_day: self.limits.daily_limit - record.day_count,
            remaining_minute: self.limits.minute_limit - record.minute_count,
        }
    }

    /// Copy of a key's current record, for inspection.
    pub fn snapshot(&self, key: &str) -> Option<ApiKeyRecord> {
        self.records.get(key).map(|slot| lock(slot).clone())
    }
}

// A panic while holding a record cannot leave it half-updated (the counters are
// plain integers), so a poisoned lock is still safe to use.
fn lock(slot: &Mutex<ApiKeyRecord>) -> MutexGuard<'_, ApiKeyRecord> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
