use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::browser::navigator::Cancellation;
use crate::browser::{BrowserSession, PageNavigator, SessionPool};
use crate::config::ScrapeConfig;
use crate::error::ScrapeError;
use crate::extract::{collect_videos, extract_channel, merge_about, needs_about};
use crate::models::{ScrapeMetadata, ScrapeRequest, ScrapeResult};

/// Cancels the blocking job when the request future goes away, whether the
/// deadline fired or the client disconnected.
struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Runs one scrape end to end on a leased session.
pub struct Scraper {
    pool: Arc<SessionPool>,
    navigator: Arc<PageNavigator>,
    config: ScrapeConfig,
}

impl Scraper {
    pub fn new(pool: Arc<SessionPool>, navigator: PageNavigator, config: ScrapeConfig) -> Self {
        Self {
            pool,
            navigator: Arc::new(navigator),
            config,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn config(&self) -> &ScrapeConfig {
        &self.config
    }

    /// Scrapes within the configured deadline. A crashed session is disposed
    /// and the whole scrape retried once on a fresh one.
    pub async fn scrape(&self, request: ScrapeRequest) -> Result<ScrapeResult, ScrapeError> {
        let cancel = Cancellation::new();
        let _guard = CancelOnDrop(cancel.clone());
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            self.config.deadline,
            self.scrape_with_retry(&request, &cancel),
        )
        .await;
        match outcome {
            Ok(Ok(result)) => {
                info!(
                    handle = %request.handle,
                    videos = result.videos.len(),
                    elapsed = ?started.elapsed(),
                    "scrape finished"
                );
                Ok(result)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                cancel.cancel();
                warn!(
                    handle = %request.handle,
                    deadline = ?self.config.deadline,
                    "scrape deadline elapsed"
                );
                Err(ScrapeError::Timeout(format!(
                    "scrape of {} did not finish within {:?}",
                    request.handle, self.config.deadline
                )))
            }
        }
    }

    async fn scrape_with_retry(
        &self,
        request: &ScrapeRequest,
        cancel: &Cancellation,
    ) -> Result<ScrapeResult, ScrapeError> {
        match self.attempt(request, cancel).await {
            Err(ScrapeError::SessionCrashed(message)) => {
                warn!(
                    handle = %request.handle,
                    "session crashed, retrying on a fresh session: {}", message
                );
                self.attempt(request, cancel).await
            }
            other => other,
        }
    }

    async fn attempt(
        &self,
        request: &ScrapeRequest,
        cancel: &Cancellation,
    ) -> Result<ScrapeResult, ScrapeError> {
        let lease = self.pool.lease().await?;
        let navigator = self.navigator.clone();
        let request = request.clone();
        let cancel = cancel.clone();
        let fetch_about = self.config.fetch_about;

        tokio::task::spawn_blocking(move || {
            let mut session_ok = true;
            let result = run_scrape(
                &navigator,
                lease.session(),
                &request,
                fetch_about,
                &cancel,
                &mut session_ok,
            );
            let healthy = match &result {
                Ok(_) => session_ok,
                Err(e) => !e.poisons_session(),
            };
            // Abandoned work may have left the page mid-navigation
            lease.release(healthy && !cancel.is_cancelled());
            result
        })
        .await
        .map_err(|e| ScrapeError::Internal(format!("scrape task failed: {}", e)))?
    }
}

fn run_scrape(
    navigator: &PageNavigator,
    session: &dyn BrowserSession,
    request: &ScrapeRequest,
    fetch_about: bool,
    cancel: &Cancellation,
    session_ok: &mut bool,
) -> Result<ScrapeResult, ScrapeError> {
    let base_url = navigator.config().base_url.as_str();

    let page = navigator.load(session, &request.handle.videos_url(base_url), cancel)?;
    let mut channel = extract_channel(&page, &request.handle)?;
    let collection = collect_videos(navigator, session, &page, request.max_videos, cancel)?;
    let mut pages_loaded = collection.pages_loaded;

    if fetch_about && needs_about(&channel) {
        cancel.check()?;
        match navigator.load(session, &request.handle.about_url(base_url), cancel) {
            Ok(about) => {
                pages_loaded += 1;
                merge_about(&mut channel, &about);
            }
            Err(e @ ScrapeError::SessionCrashed(_)) => return Err(e),
            Err(e) => {
                // The header fields are enough to answer; just don't reuse the session
                *session_ok = false;
                warn!(handle = %request.handle, "about page unavailable: {}", e);
            }
        }
    }

    let metadata = ScrapeMetadata {
        total_videos_found: collection.total_found,
        videos_processed: collection.videos.len(),
        videos_failed: collection.failed.len(),
        failed_videos: collection.failed,
        pages_loaded,
        scraped_at: page.captured_at(),
    };

    Ok(ScrapeResult {
        channel,
        videos: collection.videos,
        metadata,
    })
}
