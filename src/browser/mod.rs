//! Headless browser plumbing: the session seam, the bounded session pool, and
//! the page navigator that turns a leased session into rendered pages.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use channel_scraper::browser::{ChromeFactory, PageNavigator, SessionPool};
//! use channel_scraper::browser::navigator::Cancellation;
//! use channel_scraper::config::{BrowserConfig, NavigatorConfig, PoolConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = Arc::new(ChromeFactory::new(BrowserConfig::default()));
//! let pool = SessionPool::new(factory, PoolConfig::default());
//! let navigator = PageNavigator::new(NavigatorConfig::default());
//!
//! let lease = pool.lease().await?;
//! let page = tokio::task::spawn_blocking(move || {
//!     let url = "https://www.youtube.com/@example/videos";
//!     let page = navigator.load(lease.session(), url, &Cancellation::new());
//!     lease.release(page.is_ok());
//!     page.map(|p| p.url().to_string())
//! })
//! .await??;
//! println!("loaded {}", page);
//! # Ok(())
//! # }
//! ```

pub mod navigator;
pub mod pool;
pub mod session;

pub use navigator::{PageNavigator, RenderedPage};
pub use pool::{Lease, PoolStatus, SessionPool};
pub use session::{BrowserSession, ChromeFactory, SessionFactory};
