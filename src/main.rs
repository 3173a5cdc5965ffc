use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use channel_scraper::api::{self, AppState};
use channel_scraper::auth::AuthGate;
use channel_scraper::browser::{ChromeFactory, PageNavigator, SessionFactory, SessionPool};
use channel_scraper::config::AppConfig;
use channel_scraper::quota::QuotaStore;
use channel_scraper::scrape::Scraper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("channel_scraper=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::from_env()?;

    let quota = Arc::new(QuotaStore::new(
        config.quota.clone(),
        config.api_keys.iter().map(|k| (k.key.clone(), k.owner.clone())),
    ));
    let auth = AuthGate::new(&config.api_keys, quota);

    let factory = Arc::new(ChromeFactory::new(config.browser.clone()));
    if !factory.can_spawn() {
        tracing::warn!(
            "no Chrome/Chromium executable found, scrapes will fail until one is installed"
        );
    }
    let pool = SessionPool::new(factory, config.pool.clone());
    let _reaper = pool.spawn_reaper();

    let scraper = Scraper::new(
        pool.clone(),
        PageNavigator::new(config.navigator.clone()),
        config.scrape.clone(),
    );
    let app = api::router(Arc::new(AppState { auth, scraper }));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %listener.local_addr()?,
        keys = config.api_keys.len(),
        max_sessions = config.pool.max_sessions,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    pool.shutdown();
    Ok(())
}
