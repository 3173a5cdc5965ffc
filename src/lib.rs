//! HTTP service that scrapes a video channel's metadata and recent uploads
//! with a pool of headless browsers, behind API-key authentication and
//! per-key quotas.

pub mod api;
pub mod auth;
pub mod browser;
pub mod config;
pub mod error;
pub mod extract;
pub mod models;
pub mod normalize;
pub mod quota;
pub mod scrape;

#[cfg(test)]
mod testing;
