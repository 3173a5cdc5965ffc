use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ApiKeyConfig;
use crate::error::ScrapeError;
use crate::quota::{QuotaDecision, QuotaStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Missing,
    Invalid,
}

impl AuthFailure {
    pub fn code(&self) -> &'static str {
        match self {
            AuthFailure::Missing => "missing_api_key",
            AuthFailure::Invalid => "invalid_api_key",
        }
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Missing => f.write_str("missing API key"),
            AuthFailure::Invalid => f.write_str("invalid API key"),
        }
    }
}

/// A key that passed both the secret comparison and the quota check.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub owner: String,
    pub remaining_day: u32,
    pub remaining_minute: u32,
}

struct RegisteredKey {
    owner: String,
    key: String,
    digest: [u8; 32],
}

/// Admits a request only if its key is on the allow-list and still has quota.
/// Runs before any browser work so rejected requests cost nothing.
pub struct AuthGate {
    keys: Vec<RegisteredKey>,
    quota: Arc<QuotaStore>,
}

impl AuthGate {
    pub fn new(keys: &[ApiKeyConfig], quota: Arc<QuotaStore>) -> Self {
        let keys = keys
            .iter()
            .map(|k| RegisteredKey {
                owner: k.owner.clone(),
                key: k.key.clone(),
                digest: digest(&k.key),
            })
            .collect();
        Self { keys, quota }
    }

    pub fn authorize(&self, presented: Option<&str>) -> Result<AuthorizedKey, ScrapeError> {
        let presented = match presented.map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => return Err(ScrapeError::Unauthorized(AuthFailure::Missing)),
        };

        let matched = self.find(presented).ok_or_else(|| {
            debug!("rejected request with unknown API key");
            ScrapeError::Unauthorized(AuthFailure::Invalid)
        })?;

        match self.quota.check_and_increment(&matched.key) {
            QuotaDecision::Allowed {
                remaining_day,
                remaining_minute,
            } => Ok(AuthorizedKey {
                owner: matched.owner.clone(),
                remaining_day,
                remaining_minute,
            }),
            QuotaDecision::Denied {
                reason,
                retry_after,
            } => {
                warn!(owner = %matched.owner, %reason, "quota denied");
                Err(ScrapeError::Quota {
                    reason,
                    retry_after,
                })
            }
        }
    }

    /// Compares against every registered key without short-circuiting. Hashing
    /// first makes the comparison length-independent.
    fn find(&self, presented: &str) -> Option<&RegisteredKey> {
        let candidate = digest(presented);
        let mut found = None;
        for key in &self.keys {
            if constant_time_eq(&key.digest, &candidate) && found.is_none() {
                found = Some(key);
            }
        }
        found
    }
}

fn digest(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
