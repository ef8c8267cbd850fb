use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::browser::BrowserSettings;
use crate::crawler::CrawlSettings;
use crate::navigator::NavigatorConfig;
use crate::service::ServiceSettings;

pub const DEFAULT_TARGET_URL: &str = "https://www.longtermcare.or.kr/npbs/r/a/201/selectXLtcoSrch";
pub const DEFAULT_DATABASE: &str = "caremap.db";
pub const DEFAULT_STATE_DIR: &str = ".crawler-temp";

#[derive(Debug, thiserror::Error)]
#[error("Invalid value for {name}: '{value}' ({expected})")]
pub struct ConfigError {
    name: &'static str,
    value: String,
    expected: &'static str,
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub target_url: String,
    pub kakao_api_key: Option<String>,
    pub database_path: PathBuf,
    pub state_dir: PathBuf,
    pub browser: BrowserSettings,
    pub navigator: NavigatorConfig,
    pub row_retries: u32,
    pub row_retry_delay: Duration,
    pub geocode_delay: Duration,
    pub staleness_window: Duration,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            target_url: DEFAULT_TARGET_URL.to_string(),
            kakao_api_key: None,
            database_path: PathBuf::from(DEFAULT_DATABASE),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            browser: BrowserSettings::default(),
            navigator: NavigatorConfig::default(),
            row_retries: 3,
            row_retry_delay: Duration::from_secs(2),
            geocode_delay: Duration::from_millis(100),
            staleness_window: Duration::from_secs(5 * 60),
        }
    }
}

fn parse_bool(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError {
            name,
            value,
            expected: "a boolean",
        }),
    }
}

fn parse_number<T: FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError {
        name,
        value,
        expected: "a non-negative integer in range",
    })
}

impl CrawlerConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("CRAWLER_TARGET_URL") {
            config.target_url = url;
        }
        config.kakao_api_key = var("KAKAO_REST_API_KEY");
        if let Some(path) = var("CAREMAP_DATABASE") {
            config.database_path = PathBuf::from(path);
        }
        if let Some(dir) = var("CAREMAP_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(value) = var("CRAWLER_HEADLESS") {
            config.browser.headless = parse_bool("CRAWLER_HEADLESS", value)?;
        }
        if let Some(value) = var("CRAWLER_REQUEST_TIMEOUT_SECS") {
            let secs = parse_number("CRAWLER_REQUEST_TIMEOUT_SECS", value)?;
            config.browser.request_timeout = Duration::from_secs(secs);
            config.navigator.load_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = var("CRAWLER_RETRY_LIMIT") {
            config.row_retries = parse_number("CRAWLER_RETRY_LIMIT", value)?;
        }
        if let Some(value) = var("GEOCODE_DELAY_MS") {
            config.geocode_delay = Duration::from_millis(parse_number("GEOCODE_DELAY_MS", value)?);
        }
        Ok(config)
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            target_url: self.target_url.clone(),
            navigator: self.navigator.clone(),
            row_retries: self.row_retries,
            row_retry_delay: self.row_retry_delay,
        }
    }

    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            staleness_window: self.staleness_window,
            geocode_delay: self.geocode_delay,
        }
    }
}
