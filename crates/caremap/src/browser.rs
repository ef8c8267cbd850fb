use std::future::Future;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;

/// URL patterns for images, stylesheets, fonts and media. The results table does
/// not need any of them.
const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.svg", "*.webp", "*.ico", "*.css", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.eot", "*.mp4", "*.webm", "*.mp3",
];

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Browser launch failed: {0}")]
    Launch(String),
    #[error("DevTools protocol error: {0}")]
    Cdp(#[from] CdpError),
    #[error("Browser connection lost: {0}")]
    Disconnected(String),
}

/// A single browser tab the navigator can drive.
pub trait PageDriver: Send + Sync + Sized {
    fn goto(&self, url: &str) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Serialized DOM of the current document.
    fn content(&self) -> impl Future<Output = Result<String, DriverError>> + Send;

    fn evaluate(
        &self,
        script: &str,
    ) -> impl Future<Output = Result<serde_json::Value, DriverError>> + Send;

    /// Releases the tab and the browser process behind it.
    fn close(self) -> impl Future<Output = Result<(), DriverError>> + Send;
}

pub trait BrowserLauncher: Send + Sync {
    type Driver: PageDriver + 'static;

    fn launch(&self) -> impl Future<Output = Result<Self::Driver, DriverError>> + Send;
}

#[derive(Debug, Clone)]
pub struct BrowserSettings {
    pub headless: bool,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub block_resources: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(30),
            block_resources: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChromeLauncher {
    settings: BrowserSettings,
}

impl ChromeLauncher {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }
}

impl BrowserLauncher for ChromeLauncher {
    type Driver = ChromePage;

    async fn launch(&self) -> Result<ChromePage, DriverError> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.settings.request_timeout)
            .args(["--disable-gpu", "--disable-dev-shm-usage", "--disable-setuid-sandbox"]);
        if !self.settings.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(DriverError::Launch)?;

        log::info!("Launching browser (headless: {})", self.settings.headless);
        let (browser, mut handler) = Browser::launch(config)
            .await
            .inspect_err(|e| log::error!("Browser launch error: {e:?}"))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("Browser handler stopped: {e}");
                    break;
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                ChromePage::shutdown(browser, handler_task).await;
                return Err(e.into());
            }
        };

        let driver = ChromePage {
            browser,
            page,
            handler_task,
        };
        if let Err(e) = driver.prepare(&self.settings).await {
            log::error!("Failed to prepare browser tab: {e}");
            let _ = driver.close().await;
            return Err(e);
        }

        Ok(driver)
    }
}

pub struct ChromePage {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
}

impl ChromePage {
    /// The handler task ends when the browser process goes away.
    fn ensure_connected(&self) -> Result<(), DriverError> {
        if self.handler_task.is_finished() {
            return Err(DriverError::Disconnected(
                "browser event handler has stopped".to_string(),
            ));
        }
        Ok(())
    }

    async fn prepare(&self, settings: &BrowserSettings) -> Result<(), DriverError> {
        self.page.set_user_agent(settings.user_agent.as_str()).await?;
        if settings.block_resources {
            self.page.execute(EnableParams::default()).await?;
            let patterns = BLOCKED_RESOURCE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>();
            self.page.execute(SetBlockedUrLsParams::new(patterns)).await?;
        }
        Ok(())
    }

    async fn shutdown(mut browser: Browser, handler_task: JoinHandle<()>) -> Option<CdpError> {
        let result = browser.close().await.err();
        if let Err(e) = browser.wait().await {
            log::debug!("Browser process wait failed: {e}");
        }
        handler_task.abort();
        result
    }
}

impl PageDriver for ChromePage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        self.ensure_connected()?;
        self.page
            .goto(url)
            .await
            .inspect_err(|e| log::error!("Navigation error: {e:?}"))?;
        Ok(())
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.ensure_connected()?;
        Ok(self.page.content().await?)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, DriverError> {
        self.ensure_connected()?;
        let result = self.page.evaluate(script).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn close(self) -> Result<(), DriverError> {
        log::debug!("Closing browser");
        match Self::shutdown(self.browser, self.handler_task).await {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
