//! Test doubles for the browser and geocoder seams.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserLauncher, DriverError, PageDriver};
use crate::crawler::CrawlSettings;
use crate::geocoding::{GeocodeError, Geocoder};
use crate::navigator::NavigatorConfig;
use crate::parser::institution_code;
use crate::types::{Coordinates, CrawledRecord, ServiceType};

pub fn fast_navigator_config() -> NavigatorConfig {
    NavigatorConfig {
        load_timeout: Duration::from_secs(5),
        table_timeout: Duration::from_millis(50),
        transition_timeout: Duration::from_millis(30),
        poll_interval: Duration::from_millis(5),
        settle_delay: Duration::from_millis(5),
        stabilize_delay: Duration::ZERO,
    }
}

pub fn fast_crawl_settings() -> CrawlSettings {
    CrawlSettings {
        target_url: "https://registry.test/list".to_string(),
        navigator: fast_navigator_config(),
        row_retries: 3,
        row_retry_delay: Duration::from_millis(5),
    }
}

/// A results page with `rows` institutions numbered after the previous pages,
/// plus a `goPage(page + 1)` control when `has_next`.
pub fn listing_page(page: u32, rows: u32, has_next: bool) -> String {
    let body: String = (1..=rows)
        .map(|i| {
            let index = (page - 1) * rows + i;
            format!(
                r#"<tr><td id="ltcMapList">{index}.기관{index} 방문요양 서울특별시 중구 세종대로 {index}</td><td>정원: 20</td><td>현원: {}</td></tr>"#,
                10 + i
            )
        })
        .collect();
    let next = if has_next {
        format!(r##"<a href="#" onclick="goPage({0})">{0}</a>"##, page + 1)
    } else {
        String::new()
    };
    format!(
        r#"<html><body>
<table id="ltco_info_list"><tbody>{body}</tbody></table>
<div class="paging"><strong>{page}</strong>{next}</div>
</body></html>"#
    )
}

pub fn record(index: u32, current_headcount: u32) -> CrawledRecord {
    CrawledRecord {
        institution_code: institution_code(index),
        name: format!("기관{index}"),
        service_type: ServiceType::HomeVisitCare,
        address: format!("서울특별시 중구 세종대로 {index}"),
        capacity: 30,
        current_headcount,
    }
}

pub fn coords(latitude: f64, longitude: f64) -> Coordinates {
    Coordinates {
        latitude,
        longitude,
    }
}

#[derive(Default)]
struct BrowserCounters {
    gotos: AtomicUsize,
    clicks: AtomicUsize,
    closed: AtomicUsize,
}

/// Serves a fixed sequence of pages; an evaluated click script moves to the next one.
pub struct FakePage {
    pages: Arc<Vec<String>>,
    index: Mutex<usize>,
    counters: Arc<BrowserCounters>,
    fail_clicks: bool,
    hold: Option<CancellationToken>,
}

impl FakePage {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            pages: Arc::new(pages),
            index: Mutex::new(0),
            counters: Arc::default(),
            fail_clicks: false,
            hold: None,
        }
    }

    pub fn clicks(&self) -> usize {
        self.counters.clicks.load(Ordering::SeqCst)
    }
}

impl PageDriver for FakePage {
    async fn goto(&self, _url: &str) -> Result<(), DriverError> {
        if let Some(hold) = &self.hold {
            hold.cancelled().await;
        }
        self.counters.gotos.fetch_add(1, Ordering::SeqCst);
        *self.index.lock().unwrap() = 0;
        Ok(())
    }

    async fn content(&self) -> Result<String, DriverError> {
        let index = *self.index.lock().unwrap();
        Ok(self.pages.get(index).cloned().unwrap_or_default())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, DriverError> {
        if !script.contains("el.click()") {
            return Ok(serde_json::Value::Null);
        }
        if self.fail_clicks {
            return Err(DriverError::Disconnected("tab crashed".to_string()));
        }
        self.counters.clicks.fetch_add(1, Ordering::SeqCst);
        let mut index = self.index.lock().unwrap();
        *index = (*index + 1).min(self.pages.len().saturating_sub(1));
        Ok(serde_json::Value::Bool(true))
    }

    async fn close(self) -> Result<(), DriverError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone)]
pub struct FakeLauncher {
    pages: Arc<Vec<String>>,
    counters: Arc<BrowserCounters>,
    fail_launch: bool,
    fail_clicks: bool,
    hold: Option<CancellationToken>,
}

impl FakeLauncher {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            pages: Arc::new(pages),
            counters: Arc::default(),
            fail_launch: false,
            fail_clicks: false,
            hold: None,
        }
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn failing_clicks(mut self) -> Self {
        self.fail_clicks = true;
        self
    }

    /// Page loads block until `release` is cancelled.
    pub fn held_until(mut self, release: CancellationToken) -> Self {
        self.hold = Some(release);
        self
    }

    pub fn gotos(&self) -> usize {
        self.counters.gotos.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }
}

impl BrowserLauncher for FakeLauncher {
    type Driver = FakePage;

    async fn launch(&self) -> Result<FakePage, DriverError> {
        if self.fail_launch {
            return Err(DriverError::Launch("no chrome binary".to_string()));
        }
        Ok(FakePage {
            pages: self.pages.clone(),
            index: Mutex::new(0),
            counters: self.counters.clone(),
            fail_clicks: self.fail_clicks,
            hold: self.hold.clone(),
        })
    }
}

/// Resolves every address to a fixed point except the ones it is told to fail on.
#[derive(Default)]
pub struct FakeGeocoder {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl FakeGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, address: impl Into<String>) -> Self {
        self.failing.insert(address.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for FakeGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(address) {
            return Err(GeocodeError::Status(503));
        }
        Ok(Some(coords(37.5665, 126.978)))
    }
}
