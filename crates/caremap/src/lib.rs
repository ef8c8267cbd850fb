pub mod browser;
pub mod config;
pub mod crawler;
pub mod geocoding;
pub mod navigator;
pub mod parser;
pub mod reconcile;
pub mod service;
pub mod status;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use browser::{BrowserSettings, ChromeLauncher};
pub use config::CrawlerConfig;
pub use crawler::Crawler;
pub use geocoding::KakaoGeocoder;
pub use service::{CrawlService, ServiceError};
pub use status::{StagingArea, StatusBoard};
pub use store::SqliteStore;
