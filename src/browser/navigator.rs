use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::session::BrowserSession;
use crate::config::NavigatorConfig;
use crate::error::{BrowserError, ScrapeError};
use crate::extract::selectors::{FieldSelector, FieldSpec};

/// Shared flag that tells blocking work to stop at its next checkpoint.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ScrapeError> {
        if self.is_cancelled() {
            Err(ScrapeError::Timeout(
                "request cancelled before the scrape finished".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Rendered page
// ============================================================================

/// Snapshot of a loaded page: its DOM and the embedded `ytInitialData`.
/// Field lookups go through selector tables so layout changes stay out of the
/// extraction code.
pub struct RenderedPage {
    url: String,
    document: Html,
    initial_data: Option<Value>,
    captured_at: DateTime<Utc>,
}

impl RenderedPage {
    pub fn new(url: impl Into<String>, html: &str, initial_data: Option<Value>) -> Self {
        Self {
            url: url.into(),
            document: Html::parse_document(html),
            initial_data,
            captured_at: Utc::now(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn document(&self) -> &Html {
        &self.document
    }

    pub fn initial_data(&self) -> Option<&Value> {
        self.initial_data.as_ref()
    }

    /// Raw value for one selector, or `None` when absent or empty.
    pub fn extract(&self, selector: &FieldSelector) -> Option<String> {
        match selector {
            FieldSelector::Json(pointer) => self
                .initial_data
                .as_ref()
                .and_then(|data| data.pointer(pointer))
                .and_then(json_text),
            FieldSelector::Css(css) => parse_selector(css).and_then(|sel| {
                self.document
                    .select(&sel)
                    .find_map(|el| non_empty(element_text(el)))
            }),
            FieldSelector::CssAttr(css, attr) => parse_selector(css).and_then(|sel| {
                self.document
                    .select(&sel)
                    .find_map(|el| el.value().attr(attr).and_then(|v| non_empty(v.to_string())))
            }),
        }
    }

    /// First candidate of `spec` that yields a value.
    pub fn extract_field(&self, spec: &FieldSpec) -> Option<String> {
        spec.candidates.iter().find_map(|candidate| self.extract(candidate))
    }
}

pub(crate) fn parse_selector(css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(selector) => Some(selector),
        Err(e) => {
            warn!(selector = css, "invalid CSS selector: {:?}", e);
            None
        }
    }
}

/// Collapsed text content of an element.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Text of a JSON node in any of the shapes the platform uses for labels:
/// plain strings, `{simpleText}`, `{content}`, or `{runs: [{text}]}`.
pub(crate) fn json_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_empty(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => {
            if let Some(text) = map.get("simpleText").and_then(json_text) {
                return Some(text);
            }
            if let Some(text) = map.get("content").and_then(json_text) {
                return Some(text);
            }
            if let Some(Value::Array(runs)) = map.get("runs") {
                let joined: String = runs
                    .iter()
                    .filter_map(|run| run.get("text").and_then(Value::as_str))
                    .collect();
                return non_empty(joined);
            }
            None
        }
        _ => None,
    }
}

// ============================================================================
// Navigator
// ============================================================================

/// Drives a leased session: navigation with readiness wait and bounded
/// retries, page capture, and scroll pagination. All methods block.
pub struct PageNavigator {
    config: NavigatorConfig,
}

impl PageNavigator {
    pub fn new(config: NavigatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NavigatorConfig {
        &self.config
    }

    /// Loads `url` and captures it. Transient failures are retried up to
    /// `max_retries` times with doubling backoff; crashes and other failures
    /// are returned immediately.
    pub fn load(
        &self,
        session: &dyn BrowserSession,
        url: &str,
        cancel: &Cancellation,
    ) -> Result<RenderedPage, ScrapeError> {
        let attempts = self.config.max_retries + 1;

        for attempt in 1..=attempts {
            cancel.check()?;
            let started = Instant::now();

            let outcome = self
                .load_once(session, url, cancel)
                .and_then(|_| self.capture(session, url));

            match outcome {
                Ok(page) => {
                    info!(url, attempt, elapsed = ?started.elapsed(), "page loaded");
                    return Ok(page);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    cancel.check()?;
                    let backoff = self.config.backoff * 2u32.saturating_pow(attempt - 1);
                    warn!(url, attempt, backoff = ?backoff, "transient navigation failure: {}", e);
                    std::thread::sleep(backoff);
                }
                Err(e) => {
                    warn!(url, attempt, "navigation failed: {}", e);
                    return Err(navigation_error(url, e, attempt));
                }
            }
        }

        Err(ScrapeError::Navigation {
            url: url.to_string(),
            message: "navigation retries exhausted".to_string(),
            retries_exhausted: true,
        })
    }

    fn load_once(
        &self,
        session: &dyn BrowserSession,
        url: &str,
        cancel: &Cancellation,
    ) -> Result<(), BrowserError> {
        session.navigate(url)?;
        self.wait_ready(session, cancel)
    }

    /// Polls the readiness signal until `nav_timeout`.
    fn wait_ready(
        &self,
        session: &dyn BrowserSession,
        cancel: &Cancellation,
    ) -> Result<(), BrowserError> {
        let deadline = Instant::now() + self.config.nav_timeout;
        loop {
            if session.document_ready()? {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(BrowserError::Timeout(
                    "page readiness (request cancelled)".to_string(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(format!(
                    "page readiness after {:?}",
                    self.config.nav_timeout
                )));
            }
            std::thread::sleep(self.config.ready_poll);
        }
    }

    /// Snapshot of whatever the session currently shows.
    pub fn capture(
        &self,
        session: &dyn BrowserSession,
        url: &str,
    ) -> Result<RenderedPage, BrowserError> {
        let html = session.content()?;
        let initial_data = session.initial_data()?;
        debug!(
            url,
            html_len = html.len(),
            has_initial_data = initial_data.is_some(),
            "page captured"
        );
        Ok(RenderedPage::new(url, &html, initial_data))
    }

    /// Scrolls to the bottom and waits for lazy-loaded items to render.
    pub fn paginate(&self, session: &dyn BrowserSession) -> Result<(), BrowserError> {
        session.scroll_to_bottom()?;
        if !self.config.pagination_settle.is_zero() {
            std::thread::sleep(self.config.pagination_settle);
        }
        Ok(())
    }
}

fn navigation_error(url: &str, err: BrowserError, attempts: u32) -> ScrapeError {
    match err {
        BrowserError::Crashed(message) => ScrapeError::SessionCrashed(message),
        BrowserError::Timeout(message) => {
            ScrapeError::Timeout(format!("loading {}: {}", url, message))
        }
        other => ScrapeError::Navigation {
            url: url.to_string(),
            retries_exhausted: other.is_transient(),
            message: if other.is_transient() {
                format!("{} (after {} attempts)", other, attempts)
            } else {
                other.to_string()
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::SessionFactory;
    use crate::testing::{fast_navigator_config, ChannelFixture, ScriptedFactory};
    use serde_json::json;
    use std::time::Duration;

    fn navigator() -> PageNavigator {
        PageNavigator::new(fast_navigator_config())
    }

    #[test]
    fn test_extract_json_shapes() {
        let page = RenderedPage::new(
            "https://x.test",
            "<html></html>",
            Some(json!({
                "a": "plain",
                "b": {"simpleText": "1.2M subscribers"},
                "c": {"runs": [{"text": "42"}, {"text": " videos"}]},
                "d": {"content": "Joined Jan 1, 2022"},
                "e": 17,
                "f": ""
            })),
        );
        assert_eq!(page.extract(&FieldSelector::Json("/a")).as_deref(), Some("plain"));
        assert_eq!(page.extract(&FieldSelector::Json("/b")).as_deref(), Some("1.2M subscribers"));
        assert_eq!(page.extract(&FieldSelector::Json("/c")).as_deref(), Some("42 videos"));
        assert_eq!(page.extract(&FieldSelector::Json("/d")).as_deref(), Some("Joined Jan 1, 2022"));
        assert_eq!(page.extract(&FieldSelector::Json("/e")).as_deref(), Some("17"));
        assert_eq!(page.extract(&FieldSelector::Json("/f")), None);
        assert_eq!(page.extract(&FieldSelector::Json("/missing")), None);
    }

    #[test]
    fn test_extract_css() {
        let page = RenderedPage::new(
            "https://x.test",
            r#"<html><head><meta property="og:title" content="Example"></head>
               <body><span id="subs">  1.2M
               subscribers </span><p class="empty"> </p><p class="empty">second</p></body></html>"#,
            None,
        );
        assert_eq!(page.extract(&FieldSelector::Css("#subs")).as_deref(), Some("1.2M subscribers"));
        assert_eq!(
            page.extract(&FieldSelector::CssAttr("meta[property='og:title']", "content"))
                .as_deref(),
            Some("Example")
        );
        assert_eq!(page.extract(&FieldSelector::Css("p.empty")).as_deref(), Some("second"));
        assert_eq!(page.extract(&FieldSelector::Css("#nope")), None);
        assert_eq!(page.extract(&FieldSelector::Css("[[invalid")), None);
    }

    #[test]
    fn test_load_succeeds() {
        let factory = ScriptedFactory::new(ChannelFixture::example(4));
        let session = factory.spawn().unwrap();
        let page = navigator()
            .load(session.as_ref(), "https://www.youtube.com/@example/videos", &Cancellation::new())
            .unwrap();
        assert!(page.initial_data().is_some());
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let factory = ScriptedFactory::new(ChannelFixture::example(4));
        factory.fail_navigations(2);
        let session = factory.spawn().unwrap();
        let result = navigator().load(
            session.as_ref(),
            "https://www.youtube.com/@example/videos",
            &Cancellation::new(),
        );
        assert!(result.is_ok());
        assert_eq!(factory.navigations(), 3);
    }

    #[test]
    fn test_retries_are_bounded() {
        let factory = ScriptedFactory::new(ChannelFixture::example(4));
        factory.fail_navigations(10);
        let session = factory.spawn().unwrap();
        let result = navigator().load(
            session.as_ref(),
            "https://www.youtube.com/@example/videos",
            &Cancellation::new(),
        );
        let err = result.err().unwrap();
        assert!(matches!(
            err,
            ScrapeError::Navigation {
                retries_exhausted: true,
                ..
            }
        ));
        assert_eq!(err.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
        assert!(err.poisons_session());
        // one attempt plus two retries
        assert_eq!(factory.navigations(), 3);
    }

    #[test]
    fn test_hard_browser_failure_is_bad_gateway() {
        let err = navigation_error(
            "https://www.youtube.com/@example/videos",
            BrowserError::Script("Runtime.evaluate threw".into()),
            1,
        );
        assert!(matches!(
            err,
            ScrapeError::Navigation {
                retries_exhausted: false,
                ..
            }
        ));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_crash_is_not_retried() {
        let factory = ScriptedFactory::new(ChannelFixture::example(4));
        factory.crash_navigations(1);
        let session = factory.spawn().unwrap();
        let result = navigator().load(
            session.as_ref(),
            "https://www.youtube.com/@example/videos",
            &Cancellation::new(),
        );
        assert!(matches!(result, Err(ScrapeError::SessionCrashed(_))));
        assert_eq!(factory.navigations(), 1);
    }

    #[test]
    fn test_readiness_timeout() {
        let factory = ScriptedFactory::new(ChannelFixture::example(4));
        factory.never_ready();
        let session = factory.spawn().unwrap();
        let mut config = fast_navigator_config();
        config.max_retries = 0;
        config.nav_timeout = Duration::from_millis(30);
        let result = PageNavigator::new(config).load(
            session.as_ref(),
            "https://www.youtube.com/@example/videos",
            &Cancellation::new(),
        );
        assert!(matches!(result, Err(ScrapeError::Timeout(_))));
    }

    #[test]
    fn test_cancelled_load_stops_early() {
        let factory = ScriptedFactory::new(ChannelFixture::example(4));
        let session = factory.spawn().unwrap();
        let cancel = Cancellation::new();
        cancel.cancel();
        let result = navigator().load(
            session.as_ref(),
            "https://www.youtube.com/@example/videos",
            &cancel,
        );
        assert!(matches!(result, Err(ScrapeError::Timeout(_))));
        assert_eq!(factory.navigations(), 0);
    }
}
