//! Scripted stand-ins for Chrome used by unit tests. A [`ChannelFixture`]
//! describes a channel; [`ScriptedFactory`] spawns sessions that render it
//! and lets tests inject spawn failures, crashes, and flaky navigations.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::browser::navigator::RenderedPage;
use crate::browser::{BrowserSession, SessionFactory};
use crate::config::NavigatorConfig;
use crate::error::BrowserError;

pub fn fast_navigator_config() -> NavigatorConfig {
    NavigatorConfig {
        base_url: "https://www.youtube.com".to_string(),
        nav_timeout: Duration::from_secs(2),
        max_retries: 2,
        backoff: Duration::from_millis(1),
        ready_poll: Duration::from_millis(1),
        pagination_settle: Duration::ZERO,
        max_pagination_rounds: 60,
    }
}

#[derive(Debug, Clone)]
pub struct FixtureVideo {
    /// Empty for an item rendered without a link
    pub id: String,
    pub title: String,
    pub views: String,
    pub age: String,
    pub duration: String,
}

#[derive(Debug, Clone)]
pub struct ChannelFixture {
    pub channel_id: String,
    pub title: String,
    pub videos: Vec<FixtureVideo>,
    pub page_size: usize,
    initial_data: bool,
    identity: bool,
    not_found: bool,
}

impl ChannelFixture {
    pub fn example(video_count: usize) -> Self {
        let videos = (0..video_count)
            .map(|i| FixtureVideo {
                id: format!("vid{:08}", i),
                title: format!("Episode {}", i + 1),
                views: format!("{}.{}K views", i + 1, i % 10),
                age: format!("{} days ago", i + 1),
                duration: format!("{}:{:02}", 10 + i, (i * 7) % 60),
            })
            .collect();
        Self {
            channel_id: "UCexample0000000000000001".to_string(),
            title: "Example Channel".to_string(),
            videos,
            page_size: 30,
            initial_data: true,
            identity: true,
            not_found: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Re-renders the video at `index` right after the first page.
    pub fn with_duplicate(mut self, index: usize) -> Self {
        let copy = self.videos[index].clone();
        let at = self.page_size.min(self.videos.len());
        self.videos.insert(at, copy);
        self
    }

    pub fn with_broken_item(mut self, index: usize) -> Self {
        self.videos[index].id.clear();
        self
    }

    pub fn without_initial_data(mut self) -> Self {
        self.initial_data = false;
        self
    }

    /// Neither the embedded data nor the DOM carries the channel id or title.
    pub fn without_identity(mut self) -> Self {
        self.identity = false;
        self
    }

    pub fn not_found(mut self) -> Self {
        self.not_found = true;
        self.identity = false;
        self
    }

    pub fn unique_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.videos
            .iter()
            .filter(|v| !v.id.is_empty() && seen.insert(v.id.clone()))
            .map(|v| v.id.clone())
            .collect()
    }

    fn unique_count(&self) -> usize {
        self.unique_ids().len()
    }

    pub fn videos_html(&self, rendered: usize) -> String {
        let mut html = String::from("<html><head>");
        if self.identity {
            html.push_str(&format!(
                concat!(
                    r#"<meta property="og:title" content="{}">"#,
                    r#"<meta itemprop="identifier" content="{}">"#,
                ),
                self.title, self.channel_id
            ));
        }
        html.push_str(r#"</head><body><ytd-app><div id="contents">"#);

        if self.not_found {
            html.push_str(concat!(
                "<yt-page-empty-state-view-model>",
                "This page isn't available.",
                "</yt-page-empty-state-view-model>",
            ));
        }

        let shown = rendered.min(self.videos.len());
        for video in &self.videos[..shown] {
            html.push_str("<ytd-rich-item-renderer><div id=\"dismissible\">");
            if video.id.is_empty() {
                html.push_str("<div id=\"thumbnail\"></div>");
            } else {
                html.push_str(&format!(
                    concat!(
                        r#"<a id="thumbnail" href="/watch?v={id}">"#,
                        "<ytd-thumbnail-overlay-time-status-renderer>",
                        r#"<span id="text" class="ytd-thumbnail-overlay-time-status-renderer">"#,
                        " {duration} </span>",
                        "</ytd-thumbnail-overlay-time-status-renderer></a>",
                    ),
                    id = video.id,
                    duration = video.duration
                ));
                html.push_str(&format!(
                    concat!(
                        r#"<a id="video-title-link" href="/watch?v={id}" title="{title}">"#,
                        r#"<yt-formatted-string id="video-title">{title}"#,
                        "</yt-formatted-string></a>",
                    ),
                    id = video.id,
                    title = video.title
                ));
            }
            html.push_str(&format!(
                concat!(
                    r#"<div id="metadata-line">"#,
                    r#"<span class="inline-metadata-item">{}</span>"#,
                    r#"<span class="inline-metadata-item">{}</span></div>"#,
                ),
                video.views, video.age
            ));
            html.push_str("</div></ytd-rich-item-renderer>");
        }
        if shown < self.videos.len() {
            html.push_str("<ytd-continuation-item-renderer></ytd-continuation-item-renderer>");
        }
        html.push_str("</div></ytd-app></body></html>");
        html
    }

    pub fn about_html(&self) -> String {
        let row = |icon: &str, value: &str| {
            format!(
                r#"<tr><td><yt-icon icon="{}"></yt-icon></td><td>{}</td></tr>"#,
                icon, value
            )
        };
        format!(
            concat!(
                r#"<html><body><ytd-app><div id="additional-info-container">"#,
                "<table><tbody>{}{}{}{}{}</tbody></table>",
                "</div></ytd-app></body></html>",
            ),
            row("person_radar", "1.2M subscribers"),
            row("my_videos", &format!("{} videos", self.unique_count())),
            row("trending_up", "1,234,567 views"),
            row("info_outline", "Joined Jan 1, 2022"),
            row("privacy_public", "United States"),
        )
    }

    pub fn initial_data(&self) -> Option<Value> {
        if !self.initial_data {
            return None;
        }
        if self.not_found {
            return Some(json!({
                "alerts": [{"alertRenderer": {
                    "type": "ERROR",
                    "text": {"simpleText": "This channel does not exist."}
                }}]
            }));
        }
        if !self.identity {
            return Some(json!({"responseContext": {}}));
        }
        Some(json!({
            "metadata": {"channelMetadataRenderer": {
                "externalId": self.channel_id,
                "title": self.title,
                "description": "Videos about examples.",
                "vanityChannelUrl": "http://www.youtube.com/@example",
                "keywords": "music \"live shows\" tour",
                "avatar": {"thumbnails": [{
                    "url": "https://yt3.ggpht.com/avatar=s900",
                    "width": 900,
                    "height": 900
                }]}
            }},
            "header": {"c4TabbedHeaderRenderer": {
                "channelId": self.channel_id,
                "title": self.title,
                "subscriberCountText": {"simpleText": "1.2M subscribers"},
                "videosCountText": {"runs": [
                    {"text": self.unique_count().to_string()},
                    {"text": " videos"}
                ]},
                "banner": {"thumbnails": [{"url": "https://yt3.ggpht.com/banner=w1060"}]}
            }}
        }))
    }

    pub fn videos_page(&self, rendered: usize) -> RenderedPage {
        RenderedPage::new(
            "https://www.youtube.com/@example/videos",
            &self.videos_html(rendered),
            self.initial_data(),
        )
    }

    pub fn about_page(&self) -> RenderedPage {
        RenderedPage::new(
            "https://www.youtube.com/@example/about",
            &self.about_html(),
            self.initial_data(),
        )
    }
}

/// Counters and fault knobs shared by a factory and its sessions.
#[derive(Default)]
struct Controls {
    spawned: AtomicUsize,
    terminated: AtomicUsize,
    navigations: AtomicUsize,
    scrolls: AtomicUsize,
    fail_spawns: AtomicUsize,
    fail_navigations: AtomicUsize,
    crash_navigations: AtomicUsize,
    fail_scrolls: AtomicUsize,
    never_ready: AtomicBool,
    navigate_delay_ms: AtomicUsize,
    spawn_delay_ms: AtomicUsize,
    liveness_delay_ms: AtomicUsize,
    stall_scrolls: AtomicUsize,
}

fn pause(millis: &AtomicUsize) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        std::thread::sleep(Duration::from_millis(millis as u64));
    }
}

/// Decrements `counter` if positive; true when a fault should fire.
fn take_fault(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct ScriptedFactory {
    fixture: ChannelFixture,
    controls: Arc<Controls>,
    sessions: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedFactory {
    pub fn new(fixture: ChannelFixture) -> Arc<Self> {
        Arc::new(Self {
            fixture,
            controls: Arc::new(Controls::default()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn spawned(&self) -> usize {
        self.controls.spawned.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.controls.terminated.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> usize {
        self.controls.navigations.load(Ordering::SeqCst)
    }

    pub fn scrolls(&self) -> usize {
        self.controls.scrolls.load(Ordering::SeqCst)
    }

    pub fn fail_spawns(&self, n: usize) {
        self.controls.fail_spawns.store(n, Ordering::SeqCst);
    }

    pub fn fail_navigations(&self, n: usize) {
        self.controls.fail_navigations.store(n, Ordering::SeqCst);
    }

    /// The next `n` navigations kill their session.
    pub fn crash_navigations(&self, n: usize) {
        self.controls.crash_navigations.store(n, Ordering::SeqCst);
    }

    pub fn fail_scrolls(&self, n: usize) {
        self.controls.fail_scrolls.store(n, Ordering::SeqCst);
    }

    pub fn never_ready(&self) {
        self.controls.never_ready.store(true, Ordering::SeqCst);
    }

    /// The next `n` scrolls succeed but render nothing new.
    pub fn stall_scrolls(&self, n: usize) {
        self.controls.stall_scrolls.store(n, Ordering::SeqCst);
    }

    pub fn slow_navigations(&self, delay: Duration) {
        self.controls
            .navigate_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn slow_spawns(&self, delay: Duration) {
        self.controls
            .spawn_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Delays every liveness check, which is what the pool runs before reuse.
    pub fn slow_liveness_checks(&self, delay: Duration) {
        self.controls
            .liveness_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Kills every session spawned so far, as if the browsers died.
    pub fn kill_all(&self) {
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.iter() {
            session.alive.store(false, Ordering::SeqCst);
        }
    }
}

impl SessionFactory for ScriptedFactory {
    fn spawn(&self) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        pause(&self.controls.spawn_delay_ms);
        if take_fault(&self.controls.fail_spawns) {
            return Err(BrowserError::Launch("scripted spawn failure".to_string()));
        }
        self.controls.spawned.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(ScriptedSession {
            fixture: self.fixture.clone(),
            controls: self.controls.clone(),
            alive: AtomicBool::new(true),
            page: Mutex::new(None),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    fn can_spawn(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
enum ScriptedPage {
    Videos { rendered: usize },
    About,
}

pub struct ScriptedSession {
    fixture: ChannelFixture,
    controls: Arc<Controls>,
    alive: AtomicBool,
    page: Mutex<Option<ScriptedPage>>,
}

impl ScriptedSession {
    fn ensure_alive(&self) -> Result<(), BrowserError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrowserError::Crashed("underlying connection is closed".to_string()))
        }
    }

    fn current(&self) -> Result<ScriptedPage, BrowserError> {
        self.page
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BrowserError::Script("no page loaded".to_string()))
    }
}

impl BrowserSession for ScriptedSession {
    fn set_user_agent(&self, _user_agent: &str) -> Result<(), BrowserError> {
        self.ensure_alive()
    }

    fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_alive()?;
        self.controls.navigations.fetch_add(1, Ordering::SeqCst);

        if self.controls.navigate_delay_ms.load(Ordering::SeqCst) > 0 {
            pause(&self.controls.navigate_delay_ms);
            self.ensure_alive()?;
        }
        if take_fault(&self.controls.crash_navigations) {
            self.alive.store(false, Ordering::SeqCst);
            return Err(BrowserError::Crashed("target closed during navigation".to_string()));
        }
        if take_fault(&self.controls.fail_navigations) {
            return Err(BrowserError::Navigation("net::ERR_CONNECTION_RESET".to_string()));
        }

        let page = if url.ends_with("/about") {
            ScriptedPage::About
        } else {
            ScriptedPage::Videos {
                rendered: self.fixture.page_size,
            }
        };
        *self.page.lock().unwrap() = Some(page);
        Ok(())
    }

    fn document_ready(&self) -> Result<bool, BrowserError> {
        self.ensure_alive()?;
        Ok(!self.controls.never_ready.load(Ordering::SeqCst))
    }

    fn content(&self) -> Result<String, BrowserError> {
        self.ensure_alive()?;
        Ok(match self.current()? {
            ScriptedPage::Videos { rendered } => self.fixture.videos_html(rendered),
            ScriptedPage::About => self.fixture.about_html(),
        })
    }

    fn initial_data(&self) -> Result<Option<Value>, BrowserError> {
        self.ensure_alive()?;
        Ok(self.fixture.initial_data())
    }

    fn scroll_to_bottom(&self) -> Result<(), BrowserError> {
        self.ensure_alive()?;
        self.controls.scrolls.fetch_add(1, Ordering::SeqCst);
        if take_fault(&self.controls.fail_scrolls) {
            return Err(BrowserError::Script("scroll script threw".to_string()));
        }
        if take_fault(&self.controls.stall_scrolls) {
            return Ok(());
        }
        let mut page = self.page.lock().unwrap();
        if let Some(ScriptedPage::Videos { rendered }) = page.as_mut() {
            *rendered = (*rendered + self.fixture.page_size).min(self.fixture.videos.len());
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        pause(&self.controls.liveness_delay_ms);
        self.alive.load(Ordering::SeqCst)
    }

    fn terminate(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.controls.terminated.fetch_add(1, Ordering::SeqCst);
    }
}
