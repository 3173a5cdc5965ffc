use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BrowserConfig;
use crate::error::BrowserError;

/// Desktop platforms and Chrome releases that identity strings are built
/// from. Only Chrome identities are offered since the engine underneath is
/// Chrome and a Gecko or WebKit string would not match its fingerprint.
const UA_PLATFORMS: &[&str] = &[
    "Windows NT 10.0; Win64; x64",
    "Macintosh; Intel Mac OS X 10_15_7",
    "X11; Linux x86_64",
];
const UA_CHROME_RELEASES: &[&str] = &["127.0.0.0", "128.0.0.0", "129.0.0.0", "130.0.0.0"];

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

/// Outgoing identity strings, every platform paired with every release. One
/// is picked per lease so a session keeps a consistent identity for the whole
/// request.
pub static USER_AGENTS: Lazy<Vec<String>> = Lazy::new(|| {
    UA_PLATFORMS
        .iter()
        .flat_map(|platform| {
            UA_CHROME_RELEASES.iter().map(move |release| {
                format!(
                    concat!(
                        "Mozilla/5.0 ({}) AppleWebKit/537.36 ",
                        "(KHTML, like Gecko) Chrome/{} Safari/537.36",
                    ),
                    platform, release
                )
            })
        })
        .collect()
});

pub fn pick_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .unwrap_or(FALLBACK_USER_AGENT)
}

/// Ready once the document finished loading and the app shell dropped its
/// loading marker.
const READY_SCRIPT: &str = r#"document.readyState === "complete"
    && !document.querySelector("ytd-app")?.hasAttribute("is-loading")"#;

const INITIAL_DATA_SCRIPT: &str = "JSON.stringify(window.ytInitialData || null)";

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.documentElement.scrollHeight); true";

const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
    window.chrome = window.chrome || { runtime: {} };
"#;

/// One running browser instance able to render one page at a time.
///
/// Methods block the calling thread; callers run them on the blocking pool.
/// `terminate` may be called from another thread while an operation is in
/// flight and must make that operation fail promptly.
pub trait BrowserSession: Send + Sync {
    fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError>;

    /// Starts navigation and waits for the main frame to commit.
    fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    fn document_ready(&self) -> Result<bool, BrowserError>;

    fn content(&self) -> Result<String, BrowserError>;

    /// The page's embedded `ytInitialData` payload, if any.
    fn initial_data(&self) -> Result<Option<Value>, BrowserError>;

    /// Triggers scroll-driven pagination.
    fn scroll_to_bottom(&self) -> Result<(), BrowserError>;

    /// Liveness probe.
    fn is_alive(&self) -> bool;

    fn terminate(&self);
}

/// Spawns fresh sessions for the pool.
pub trait SessionFactory: Send + Sync {
    fn spawn(&self) -> Result<Arc<dyn BrowserSession>, BrowserError>;

    /// Whether spawning is possible at all (browser binary present, ...).
    fn can_spawn(&self) -> bool;
}

// ============================================================================
// Headless Chrome
// ============================================================================

pub struct ChromeFactory {
    config: BrowserConfig,
}

impl ChromeFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn launch_options<'a>(&self, args: Vec<&'a OsStr>) -> Result<LaunchOptions<'a>, BrowserError> {
        LaunchOptions::default_builder()
            .headless(self.config.headless)
            .sandbox(false)
            .window_size(Some(self.config.window_size))
            .path(self.config.chrome_path.clone())
            .idle_browser_timeout(Duration::from_secs(60 * 60))
            .args(args)
            .build()
            .map_err(|e| BrowserError::Launch(e.to_string()))
    }
}

impl SessionFactory for ChromeFactory {
    fn spawn(&self) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        let mut args = vec![
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-gpu"),
            OsStr::new("--disable-notifications"),
            OsStr::new("--mute-audio"),
            OsStr::new("--autoplay-policy=user-gesture-required"),
        ];
        for flag in &self.config.extra_flags {
            args.push(OsStr::new(flag));
        }

        let browser = Browser::new(self.launch_options(args)?)
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| BrowserError::Launch(format!("tab creation failed: {}", e)))?;
        tab.set_default_timeout(self.config.nav_timeout);

        tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
            source: STEALTH_SCRIPT.to_string(),
            world_name: None,
            include_command_line_api: None,
            run_immediately: None,
        })
        .map_err(|e| BrowserError::Launch(format!("stealth script injection failed: {}", e)))?;

        info!(pid = ?browser.get_process_id(), "browser launched");
        Ok(Arc::new(ChromeSession {
            browser: Mutex::new(Some(browser)),
            tab,
        }))
    }

    fn can_spawn(&self) -> bool {
        match &self.config.chrome_path {
            Some(path) => path.exists(),
            None => headless_chrome::browser::default_executable().is_ok(),
        }
    }
}

pub struct ChromeSession {
    // Dropping the `Browser` kills the process; `terminate` takes it out.
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
}

impl ChromeSession {
    fn evaluate(&self, script: &str) -> Result<Option<Value>, BrowserError> {
        self.tab
            .evaluate(script, false)
            .map(|object| object.value)
            .map_err(classify)
    }

    fn has_browser(&self) -> bool {
        self.browser
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}

impl BrowserSession for ChromeSession {
    fn set_user_agent(&self, user_agent: &str) -> Result<(), BrowserError> {
        self.tab
            .set_user_agent(user_agent, Some("en-US,en;q=0.9"), None)
            .map_err(classify)
    }

    fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        debug!(url, "navigating");
        self.tab.navigate_to(url).map_err(classify)?;
        self.tab.wait_until_navigated().map_err(classify)?;
        Ok(())
    }

    fn document_ready(&self) -> Result<bool, BrowserError> {
        Ok(self
            .evaluate(READY_SCRIPT)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    fn content(&self) -> Result<String, BrowserError> {
        self.tab.get_content().map_err(classify)
    }

    fn initial_data(&self) -> Result<Option<Value>, BrowserError> {
        let raw = match self.evaluate(INITIAL_DATA_SCRIPT)? {
            Some(Value::String(raw)) => raw,
            _ => return Ok(None),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("ytInitialData is not valid JSON: {}", e);
                Ok(None)
            }
        }
    }

    fn scroll_to_bottom(&self) -> Result<(), BrowserError> {
        self.evaluate(SCROLL_SCRIPT).map(|_| ())
    }

    fn is_alive(&self) -> bool {
        self.has_browser() && self.evaluate("1 + 1").is_ok()
    }

    fn terminate(&self) {
        let browser = match self.browser.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(browser) = browser {
            info!(pid = ?browser.get_process_id(), "terminating browser");
            drop(browser);
        }
    }
}

/// Maps a CDP error onto the session error classes by its message.
fn classify(err: anyhow::Error) -> BrowserError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if lower.contains("connection is closed")
        || lower.contains("no such process")
        || lower.contains("no session with given id")
        || lower.contains("target closed")
        || lower.contains("channel closed")
    {
        BrowserError::Crashed(message)
    } else if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("waited for never came")
    {
        BrowserError::Timeout(message)
    } else if lower.contains("net::err_") || lower.contains("navigate") {
        BrowserError::Navigation(message)
    } else {
        BrowserError::Script(message)
    }
}
