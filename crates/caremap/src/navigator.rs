use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::browser::{DriverError, PageDriver};
use crate::parser::{elem_text, first_row_text, has_results_table, normalize_whitespace};

const CONVENTIONAL_NEXT: &str = "a.next, button.next, a#next, button#next";
const CLICKABLE: &str = "a, button";
const SCRIPT_BOUND: &str = "a[onclick]";
const NEXT_LABELS: &[&str] = &["다음", ">", "Next"];

static RE_PAGE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:goPage|movePage|goToPage)\((\d+)\)").expect("invalid regex: page call")
});

#[derive(Debug, thiserror::Error)]
pub enum NavigatorError {
    #[error("Results table did not appear within {0:?}")]
    LoadTimeout(Duration),
    #[error("Browser error: {0}")]
    Driver(#[from] DriverError),
}

/// Ways of finding the control that moves the listing to the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextPageLocator {
    /// `.next` / `#next` anchors and buttons.
    ByConventionalSelector,
    /// Anchors and buttons titled or labelled "다음", ">" or "Next".
    ByLabelText,
    /// `goPage(n)`-style onclick handlers targeting the following page.
    ByScriptBinding,
}

impl NextPageLocator {
    pub const CHAIN: [NextPageLocator; 3] = [
        NextPageLocator::ByConventionalSelector,
        NextPageLocator::ByLabelText,
        NextPageLocator::ByScriptBinding,
    ];

    pub fn locate(&self, document: &Html, current_page: u32) -> Option<NextControl> {
        match self {
            NextPageLocator::ByConventionalSelector => {
                let sel = Selector::parse(CONVENTIONAL_NEXT).unwrap();
                document
                    .select(&sel)
                    .next()
                    .map(|_| NextControl::new(*self, CONVENTIONAL_NEXT, 0))
            }
            NextPageLocator::ByLabelText => {
                let sel = Selector::parse(CLICKABLE).unwrap();
                let candidates: Vec<(usize, ElementRef)> = document
                    .select(&sel)
                    .enumerate()
                    .filter(|(_, el)| !targets_other_page(*el, current_page))
                    .collect();

                let by_title = candidates.iter().find(|(_, el)| {
                    el.value()
                        .attr("title")
                        .is_some_and(|title| title.contains("다음"))
                });
                let by_text = || {
                    candidates.iter().find(|(_, el)| {
                        let text = normalize_whitespace(&elem_text(*el));
                        NEXT_LABELS.contains(&text.as_str())
                    })
                };

                by_title
                    .or_else(by_text)
                    .map(|(i, _)| NextControl::new(*self, CLICKABLE, *i))
            }
            NextPageLocator::ByScriptBinding => {
                let sel = Selector::parse(SCRIPT_BOUND).unwrap();
                document
                    .select(&sel)
                    .position(|el| script_target(el) == Some(current_page + 1))
                    .map(|i| NextControl::new(*self, SCRIPT_BOUND, i))
            }
        }
    }
}

fn script_target(element: ElementRef) -> Option<u32> {
    let onclick = element.value().attr("onclick")?;
    RE_PAGE_CALL
        .captures(onclick)
        .and_then(|caps| caps[1].parse().ok())
}

/// A "다음 10페이지" control jumps several pages at once; a label match is only
/// trusted when it is not bound to some other page.
fn targets_other_page(element: ElementRef, current_page: u32) -> bool {
    script_target(element).is_some_and(|target| target != current_page + 1)
}

/// A reference to a clickable element: the `index`-th match of `selector` in
/// document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextControl {
    pub locator: NextPageLocator,
    pub selector: &'static str,
    pub index: usize,
}

impl NextControl {
    fn new(locator: NextPageLocator, selector: &'static str, index: usize) -> Self {
        Self {
            locator,
            selector,
            index,
        }
    }

    /// Script that clicks the control in the live page and reports whether it existed.
    pub fn click_script(&self) -> String {
        let selector = serde_json::Value::from(self.selector);
        format!(
            "(() => {{ const el = document.querySelectorAll({selector})[{index}]; if (!el) {{ return false; }} el.click(); return true; }})()",
            index = self.index
        )
    }
}

pub fn locate_next_control(html: &str, current_page: u32) -> Option<NextControl> {
    let document = Html::parse_document(html);
    NextPageLocator::CHAIN
        .iter()
        .find_map(|locator| locator.locate(&document, current_page))
}

#[derive(Debug, Clone)]
pub struct NavigatorConfig {
    pub load_timeout: Duration,
    pub table_timeout: Duration,
    pub transition_timeout: Duration,
    pub poll_interval: Duration,
    pub settle_delay: Duration,
    pub stabilize_delay: Duration,
}

impl Default for NavigatorConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            table_timeout: Duration::from_secs(10),
            transition_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            settle_delay: Duration::from_secs(3),
            stabilize_delay: Duration::from_secs(1),
        }
    }
}

pub struct Navigator<'a, D: PageDriver> {
    driver: &'a D,
    config: NavigatorConfig,
    cancel: CancellationToken,
    current_page: u32,
}

impl<'a, D: PageDriver> Navigator<'a, D> {
    pub fn new(driver: &'a D, config: NavigatorConfig, cancel: CancellationToken) -> Self {
        Self {
            driver,
            config,
            cancel,
            current_page: 0,
        }
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub async fn load_first_page(&mut self, url: &str) -> Result<(), NavigatorError> {
        log::info!("Loading {}", url);
        timeout(self.config.load_timeout, self.driver.goto(url))
            .await
            .map_err(|_| NavigatorError::LoadTimeout(self.config.load_timeout))??;

        self.wait_for_table().await?;
        self.current_page = 1;
        log::info!("Results table loaded");
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<String, NavigatorError> {
        Ok(self.driver.content().await?)
    }

    /// Moves to the next page. `Ok(false)` means there is no next page.
    pub async fn advance(&mut self) -> Result<bool, NavigatorError> {
        let html = self.driver.content().await?;
        let Some(control) = locate_next_control(&html, self.current_page) else {
            log::info!("[page {}] No next page control found", self.current_page);
            return Ok(false);
        };
        let before = first_row_text(&html).unwrap_or_default();

        log::info!(
            "[page {}] → {} via {:?}",
            self.current_page,
            self.current_page + 1,
            control.locator
        );
        let clicked = self.driver.evaluate(&control.click_script()).await?;
        if clicked != serde_json::Value::Bool(true) {
            log::warn!(
                "[page {}] Next page control vanished before it could be clicked",
                self.current_page
            );
            return Ok(false);
        }

        if !self.wait_for_transition(&before).await {
            log::warn!(
                "[page {}] Page change not detected, waiting {:?}",
                self.current_page + 1,
                self.config.settle_delay
            );
            sleep(self.config.settle_delay).await;
        }
        sleep(self.config.stabilize_delay).await;

        self.current_page += 1;
        Ok(true)
    }

    async fn wait_for_table(&self) -> Result<(), NavigatorError> {
        let deadline = Instant::now() + self.config.table_timeout;
        loop {
            match self.driver.content().await {
                Ok(html) if has_results_table(&html) => return Ok(()),
                Ok(_) => {}
                Err(e) => log::debug!("Table poll failed: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(NavigatorError::LoadTimeout(self.config.table_timeout));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Polls the first row until its text differs from `before`.
    async fn wait_for_transition(&self, before: &str) -> bool {
        let deadline = Instant::now() + self.config.transition_timeout;
        loop {
            if self.cancel.is_cancelled() {
                return true;
            }
            match self.driver.content().await {
                Ok(html) => {
                    if let Some(text) = first_row_text(&html)
                        && text != before
                    {
                        return true;
                    }
                }
                Err(e) => log::debug!("Transition poll failed: {e}"),
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(self.config.poll_interval).await;
        }
    }
}
