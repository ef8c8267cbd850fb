use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserLauncher, DriverError, PageDriver};
use crate::navigator::{Navigator, NavigatorConfig, NavigatorError};
use crate::parser::{count_result_rows, estimate_total_pages, parse_institution_rows};
use crate::types::{CrawlProgress, CrawledRecord};

/// Share of the progress bar covered by page visits; the rest belongs to completion.
const CRAWL_PHASE_PERCENT: u64 = 80;
const LOADED_PERCENT: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("Navigation failed: {0}")]
    Navigator(#[from] NavigatorError),
    #[error("Browser error: {0}")]
    Driver(#[from] DriverError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxPagesReached,
    NoMorePages,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub records: Vec<CrawledRecord>,
    pub pages_visited: u32,
    pub stop_reason: StopReason,
}

impl CrawlOutcome {
    fn stopped(records: Vec<CrawledRecord>, pages_visited: u32, stop_reason: StopReason) -> Self {
        log::info!(
            "Crawl stopped ({:?}) after {} page(s): {} institution(s)",
            stop_reason,
            pages_visited,
            records.len()
        );
        Self {
            records,
            pages_visited,
            stop_reason,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub target_url: String,
    pub navigator: NavigatorConfig,
    pub row_retries: u32,
    pub row_retry_delay: Duration,
}

pub fn crawl_percentage(page: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = u64::from(page) * CRAWL_PHASE_PERCENT / u64::from(total);
    pct.min(CRAWL_PHASE_PERCENT) as u8
}

async fn pause(cancel: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

pub struct Crawler<L: BrowserLauncher> {
    launcher: L,
    settings: CrawlSettings,
}

impl<L: BrowserLauncher> Crawler<L> {
    pub fn new(launcher: L, settings: CrawlSettings) -> Self {
        Self { launcher, settings }
    }

    /// Crawls up to `max_pages` result pages. The browser is closed on every exit path.
    pub async fn crawl<F>(
        &self,
        max_pages: u32,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<CrawlOutcome, CrawlError>
    where
        F: FnMut(CrawlProgress) + Send,
    {
        let max_pages = max_pages.max(1);
        on_progress(CrawlProgress::new(0, max_pages, 0, "Launching browser"));

        let driver = self.launcher.launch().await?;
        let result = self
            .crawl_pages(&driver, max_pages, cancel, &mut on_progress)
            .await;
        if let Err(e) = driver.close().await {
            log::warn!("Failed to close browser: {e}");
        }
        result
    }

    /// Loads the first page once and infers how many result pages exist.
    pub async fn estimate_total_pages(&self) -> Result<u32, CrawlError> {
        let driver = self.launcher.launch().await?;
        let result = async {
            let mut navigator = Navigator::new(
                &driver,
                self.settings.navigator.clone(),
                CancellationToken::new(),
            );
            navigator.load_first_page(&self.settings.target_url).await?;
            let html = navigator.snapshot().await?;
            Ok(estimate_total_pages(&html))
        }
        .await;
        if let Err(e) = driver.close().await {
            log::warn!("Failed to close browser: {e}");
        }
        result
    }

    async fn crawl_pages<F>(
        &self,
        driver: &L::Driver,
        max_pages: u32,
        cancel: &CancellationToken,
        on_progress: &mut F,
    ) -> Result<CrawlOutcome, CrawlError>
    where
        F: FnMut(CrawlProgress) + Send,
    {
        let mut navigator = Navigator::new(driver, self.settings.navigator.clone(), cancel.clone());
        let mut records = Vec::new();
        let mut pages_visited = 0;

        match navigator.load_first_page(&self.settings.target_url).await {
            Ok(()) => {}
            Err(NavigatorError::LoadTimeout(waited)) => {
                log::warn!("Results table never appeared (waited {waited:?}); nothing to crawl");
                return Ok(CrawlOutcome::stopped(records, 0, StopReason::NoMorePages));
            }
            Err(e) => return Err(e.into()),
        }
        on_progress(CrawlProgress::new(0, max_pages, LOADED_PERCENT, "Page loaded"));

        loop {
            let page = navigator.current_page();
            if cancel.is_cancelled() {
                return Ok(CrawlOutcome::stopped(records, pages_visited, StopReason::Cancelled));
            }

            on_progress(CrawlProgress::new(
                page,
                max_pages,
                crawl_percentage(page, max_pages),
                format!("Crawling page {page}"),
            ));

            let Some(html) = self.read_populated_page(&navigator, page, cancel).await? else {
                log::info!("[page {}] No rows, stopping", page);
                return Ok(CrawlOutcome::stopped(records, pages_visited, StopReason::NoMorePages));
            };

            let page_records = parse_institution_rows(&html);
            log::info!("[page {}] {} institution(s)", page, page_records.len());
            for record in page_records.iter().take(3) {
                log::debug!("[page {}] {}", page, record);
            }
            records.extend(page_records);
            pages_visited += 1;

            if page >= max_pages {
                return Ok(CrawlOutcome::stopped(records, pages_visited, StopReason::MaxPagesReached));
            }
            if cancel.is_cancelled() {
                return Ok(CrawlOutcome::stopped(records, pages_visited, StopReason::Cancelled));
            }
            if !navigator.advance().await? {
                return Ok(CrawlOutcome::stopped(records, pages_visited, StopReason::NoMorePages));
            }
        }
    }

    /// Returns the page markup once the table has rows, retrying a few times for
    /// slow renders. `None` when the table stays empty.
    async fn read_populated_page(
        &self,
        navigator: &Navigator<'_, L::Driver>,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, CrawlError> {
        let attempts = self.settings.row_retries.max(1);
        for attempt in 1..=attempts {
            let html = navigator.snapshot().await?;
            if count_result_rows(&html) > 0 {
                return Ok(Some(html));
            }
            if attempt < attempts {
                log::info!(
                    "[page {}] Waiting for rows (attempt {}/{})",
                    page,
                    attempt,
                    attempts
                );
                pause(cancel, self.settings.row_retry_delay).await;
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
        Ok(None)
    }
}
