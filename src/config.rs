use anyhow::{bail, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// One entry of the key allow-list.
#[derive(Debug, Clone)]
pub struct ApiKeyConfig {
    pub owner: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub daily_limit: u32,
    pub minute_limit: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 1000,
            minute_limit: 30,
        }
    }
}

/// Launch settings for every browser the pool spawns.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub window_size: (u32, u32),
    pub chrome_path: Option<PathBuf>,
    /// Per-navigation timeout, also used as the tab's default CDP timeout.
    pub nav_timeout: Duration,
    /// Additional Chrome flags appended to the stealth defaults
    pub extra_flags: Vec<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_size: (1920, 1080),
            chrome_path: None,
            nav_timeout: Duration::from_secs(30),
            extra_flags: vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on concurrently running browser instances
    pub max_sessions: usize,
    /// How long `lease` waits for a free slot before giving up
    pub lease_wait: Duration,
    /// Leases held longer than this are force-terminated
    pub max_lease: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            lease_wait: Duration::from_secs(10),
            max_lease: Duration::from_secs(180),
            reap_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub base_url: String,
    pub nav_timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub ready_poll: Duration,
    /// Pause after each scroll so lazy-loaded items can render
    pub pagination_settle: Duration,
    pub max_pagination_rounds: usize,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.youtube.com".to_string(),
            nav_timeout: Duration::from_secs(30),
            max_retries: 2,
            backoff: Duration::from_millis(500),
            ready_poll: Duration::from_millis(250),
            pagination_settle: Duration::from_millis(1500),
            max_pagination_rounds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    /// Overall deadline for one scrape, lease wait included
    pub deadline: Duration,
    pub default_max_videos: usize,
    pub max_videos_ceiling: usize,
    /// Visit the channel's about page when header stats are missing
    pub fetch_about: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(240),
            default_max_videos: 100,
            max_videos_ceiling: 500,
            fetch_about: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_keys: Vec<ApiKeyConfig>,
    pub quota: QuotaConfig,
    pub browser: BrowserConfig,
    pub pool: PoolConfig,
    pub navigator: NavigatorConfig,
    pub scrape: ScrapeConfig,
    pub port: u16,
}

impl AppConfig {
    /// Reads the process environment. Call `dotenv().ok()` first to pick up `.env`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let primary = match lookup("API_KEY").map(|k| k.trim().to_string()) {
            Some(key) if !key.is_empty() => key,
            _ => bail!("API_KEY must be set"),
        };

        let mut api_keys = vec![ApiKeyConfig {
            owner: "default".to_string(),
            key: primary,
        }];
        if let Some(extra) = lookup("API_KEYS") {
            api_keys.extend(parse_key_list(&extra));
        }

        let nav_timeout = Duration::from_secs(parsed(&lookup, "NAV_TIMEOUT_SECS", 30u64));

        let quota = QuotaConfig {
            daily_limit: parsed(&lookup, "QUOTA_DAILY_LIMIT", 1000),
            minute_limit: parsed(&lookup, "QUOTA_MINUTE_LIMIT", 30),
        };

        let browser = BrowserConfig {
            headless: parsed(&lookup, "CHROME_HEADLESS", true),
            chrome_path: lookup("CHROME_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            nav_timeout,
            extra_flags: lookup("CHROME_EXTRA_FLAGS")
                .map(|flags| flags.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            ..BrowserConfig::default()
        };

        let max_sessions = parsed(&lookup, "POOL_MAX_SESSIONS", 2usize);
        let pool = PoolConfig {
            max_sessions: if max_sessions == 0 {
                warn!("POOL_MAX_SESSIONS=0 is not usable, falling back to 1");
                1
            } else {
                max_sessions
            },
            lease_wait: Duration::from_secs(parsed(&lookup, "POOL_LEASE_WAIT_SECS", 10)),
            max_lease: Duration::from_secs(parsed(&lookup, "POOL_MAX_LEASE_SECS", 180)),
            ..PoolConfig::default()
        };

        let navigator = NavigatorConfig {
            base_url: lookup("YOUTUBE_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| NavigatorConfig::default().base_url),
            nav_timeout,
            max_retries: parsed(&lookup, "NAV_MAX_RETRIES", 2),
            backoff: Duration::from_millis(parsed(&lookup, "NAV_BACKOFF_MS", 500)),
            ..NavigatorConfig::default()
        };

        let ceiling = parsed(&lookup, "MAX_VIDEOS_CEILING", 500usize).max(1);
        let scrape = ScrapeConfig {
            deadline: Duration::from_secs(parsed(&lookup, "SCRAPE_DEADLINE_SECS", 240)),
            default_max_videos: parsed(&lookup, "DEFAULT_MAX_VIDEOS", 100usize).clamp(1, ceiling),
            max_videos_ceiling: ceiling,
            fetch_about: parsed(&lookup, "FETCH_ABOUT_PAGE", true),
        };

        Ok(Self {
            api_keys,
            quota,
            browser,
            pool,
            navigator,
            scrape,
            port: parsed(&lookup, "PORT", 8080),
        })
    }
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    variable = name,
                    value = %raw,
                    fallback = %default,
                    "invalid value, using default"
                );
                default
            }
        },
        None => default,
    }
}

/// Parses `owner:key,owner2:key2`. Entries without an owner get a generated label.
fn parse_key_list(raw: &str) -> Vec<ApiKeyConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .filter_map(|(i, entry)| {
            let (owner, key) = match entry.split_once(':') {
                Some((owner, key)) => (owner.trim().to_string(), key.trim().to_string()),
                None => (format!("key-{}", i + 1), entry.to_string()),
            };
            if key.is_empty() {
                warn!(owner = %owner, "skipping API_KEYS entry with empty key");
                return None;
            }
            Some(ApiKeyConfig { owner, key })
        })
        .collect()
}
