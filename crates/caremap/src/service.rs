use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::browser::BrowserLauncher;
use crate::crawler::{CrawlError, Crawler, StopReason};
use crate::geocoding::Geocoder;
use crate::reconcile::{BackfillSummary, Reconciler};
use crate::status::{Busy, RunGuard, StagedCrawl, StagingArea, StatusBoard, StatusError, is_stale};
use crate::store::{InstitutionFilter, InstitutionOrder, InstitutionStore, JobStore, StoreError};
use crate::types::{
    CrawlJob, CrawlProgress, CrawlStatus, Institution, InstitutionHistory, JobStatus,
    ReconcileSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("A crawl is already running{}", job_suffix(.job_id))]
    Busy { job_id: Option<i64> },
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("No staged crawl data to import")]
    NothingStaged,
    #[error("Institution {0} not found")]
    UnknownInstitution(String),
}

fn job_suffix(job_id: &Option<i64>) -> String {
    job_id.map(|id| format!(" (job {id})")).unwrap_or_default()
}

impl From<Busy> for ServiceError {
    fn from(busy: Busy) -> Self {
        ServiceError::Busy {
            job_id: busy.job_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub staleness_window: Duration,
    pub geocode_delay: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(5 * 60),
            geocode_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub struct StartedCrawl {
    pub job_id: i64,
    pub handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListing {
    pub jobs: Vec<CrawlJob>,
    pub total: u64,
    pub current: Option<CrawlJob>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstitutionTimeline {
    pub institution: Institution,
    /// Newest first.
    pub history: Vec<InstitutionHistory>,
}

struct ActiveRun {
    job_id: i64,
    cancel: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_slot(slot: &ActiveSlot) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry point for triggering crawls and importing their results.
pub struct CrawlService<L, S, G>
where
    L: BrowserLauncher + 'static,
    S: InstitutionStore + JobStore + 'static,
    G: Geocoder,
{
    crawler: Arc<Crawler<L>>,
    store: Arc<S>,
    geocoder: G,
    board: Arc<StatusBoard>,
    staging: StagingArea,
    settings: ServiceSettings,
    active: ActiveSlot,
}

impl<L, S, G> CrawlService<L, S, G>
where
    L: BrowserLauncher + 'static,
    S: InstitutionStore + JobStore + 'static,
    G: Geocoder,
{
    pub fn new(
        crawler: Crawler<L>,
        store: Arc<S>,
        geocoder: G,
        board: Arc<StatusBoard>,
        staging: StagingArea,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            crawler: Arc::new(crawler),
            store,
            geocoder,
            board,
            staging,
            settings,
            active: Arc::default(),
        }
    }

    /// Starts a crawl in the background. Fails with `Busy` while another run is
    /// alive, in this process or according to the job store.
    pub fn start(
        &self,
        max_pages: u32,
        crawler_id: Option<String>,
    ) -> Result<StartedCrawl, ServiceError> {
        let max_pages = max_pages.max(1);
        let now = Utc::now();
        let window = self.settings.staleness_window;

        let mut guard = self.board.try_acquire(window, now)?;
        if let Some(mut running) = self.store.latest_running_job()? {
            if !is_stale(Some(running.last_progress_at), window, now) {
                return Err(ServiceError::Busy {
                    job_id: Some(running.id),
                });
            }
            log::warn!(
                "Job {} has not reported progress since {}; marking it abandoned",
                running.id,
                running.last_progress_at
            );
            running.fail("Abandoned: no progress within the staleness window", now);
            self.store.update_job(&running)?;
        }

        if let Some(previous) = lock_slot(&self.active).take() {
            log::warn!("Cancelling superseded crawl of job {}", previous.job_id);
            previous.cancel.cancel();
        }

        let job = self
            .store
            .create_job(crawler_id.as_deref(), max_pages, now)?;
        guard.begin(job.id);
        log::info!("Started crawl job {} (max pages: {})", job.id, max_pages);

        let cancel = CancellationToken::new();
        *lock_slot(&self.active) = Some(ActiveRun {
            job_id: job.id,
            cancel: cancel.clone(),
        });

        let job_id = job.id;
        let handle = tokio::spawn(run_job(
            Arc::clone(&self.crawler),
            Arc::clone(&self.store),
            self.staging.clone(),
            Arc::clone(&self.active),
            guard,
            job,
            cancel,
        ));
        Ok(StartedCrawl { job_id, handle })
    }

    /// Requests cancellation of the running crawl. Returns false when no crawl
    /// runs in this process; any job still marked running in the store is then
    /// failed and the persisted marker is cleared, so the next `start` is not
    /// held off by a dead process.
    pub fn stop(&self) -> Result<bool, ServiceError> {
        if let Some(run) = lock_slot(&self.active).as_ref() {
            log::info!("Stopping crawl job {}", run.job_id);
            run.cancel.cancel();
            return Ok(true);
        }
        if let Some(mut running) = self.store.latest_running_job()? {
            log::warn!("No crawl runs in this process; marking job {} stopped", running.id);
            running.fail("stopped", Utc::now());
            self.store.update_job(&running)?;
        }
        self.board.reset();
        Ok(false)
    }

    pub fn status(&self) -> CrawlStatus {
        self.board.snapshot()
    }

    pub async fn estimate_total_pages(&self) -> Result<u32, ServiceError> {
        Ok(self.crawler.estimate_total_pages().await?)
    }

    /// Reconciles the last staged crawl into the store.
    pub async fn import_staged(&self) -> Result<ReconcileSummary, ServiceError> {
        if self.board.is_running() {
            return Err(ServiceError::Busy {
                job_id: self.board.snapshot().job_id,
            });
        }
        let staged = self.staging.load()?.ok_or(ServiceError::NothingStaged)?;
        log::info!(
            "Importing {} staged record(s) from {}",
            staged.institutions.len(),
            staged.timestamp
        );

        let summary = Reconciler::new(&*self.store, &self.geocoder, self.settings.geocode_delay)
            .reconcile(&staged.institutions)
            .await;

        if let Some(job_id) = staged.job_id {
            match self.store.find_job(job_id)? {
                Some(mut job) => {
                    job.saved_to_db = true;
                    job.created_count = summary.created;
                    job.updated_count = summary.updated;
                    job.failed_count = summary.failed;
                    self.store.update_job(&job)?;
                }
                None => log::warn!("Staged data refers to unknown job {}", job_id),
            }
        }
        Ok(summary)
    }

    pub async fn backfill_coordinates(&self, limit: usize) -> Result<BackfillSummary, ServiceError> {
        let pending = self.store.list(
            &InstitutionFilter::needs_geocoding(),
            InstitutionOrder::CodeAsc,
            Some(limit),
        )?;
        log::info!("{} institution(s) need coordinates", pending.len());
        Ok(
            Reconciler::new(&*self.store, &self.geocoder, self.settings.geocode_delay)
                .backfill_coordinates(&pending)
                .await,
        )
    }

    pub fn jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<JobListing, ServiceError> {
        Ok(JobListing {
            jobs: self.store.list_jobs(status, limit)?,
            total: self.store.count_jobs(status)?,
            current: self.store.latest_running_job()?,
        })
    }

    pub fn history(&self, institution_code: &str) -> Result<InstitutionTimeline, ServiceError> {
        let institution = self
            .store
            .find_by_code(institution_code)?
            .ok_or_else(|| ServiceError::UnknownInstitution(institution_code.to_string()))?;
        let mut history = self.store.history_for(institution.id)?;
        history.reverse();
        Ok(InstitutionTimeline {
            institution,
            history,
        })
    }
}

/// Body of the spawned crawl task. Owns the run guard for the whole run.
async fn run_job<L, S>(
    crawler: Arc<Crawler<L>>,
    store: Arc<S>,
    staging: StagingArea,
    active: ActiveSlot,
    guard: RunGuard,
    mut job: CrawlJob,
    cancel: CancellationToken,
) where
    L: BrowserLauncher + 'static,
    S: InstitutionStore + JobStore + 'static,
{
    let max_pages = job.total_pages;
    let result = crawler
        .crawl(max_pages, &cancel, |progress| {
            touch_job(&*store, job.id, progress.current);
            guard.progress(progress);
        })
        .await;

    let now = Utc::now();
    match result {
        Ok(outcome) => {
            let count = outcome.records.len() as u32;
            let pages = outcome.pages_visited;
            let staged = StagedCrawl {
                institutions: outcome.records,
                timestamp: now,
                job_id: Some(job.id),
            };
            if let Err(e) = staging.save(&staged) {
                log::error!("Failed to stage crawl results: {e}");
                job.fail(format!("Failed to stage results: {e}"), now);
                guard.fail(e.to_string());
            } else if outcome.stop_reason == StopReason::Cancelled {
                job.crawled_count = count;
                job.fail("cancelled", now);
                guard.fail(format!(
                    "Crawl cancelled after {pages} page(s); {count} institution(s) staged"
                ));
            } else {
                job.complete(count, now);
                guard.complete(CrawlProgress::new(
                    pages,
                    max_pages,
                    100,
                    format!("Crawl complete: {count} institution(s)"),
                ));
            }
        }
        Err(e) => {
            log::error!("Crawl job {} failed: {}", job.id, e);
            if let Err(e) = staging.clear() {
                log::warn!("Failed to clear staged data: {e}");
            }
            job.fail(e.to_string(), now);
            guard.fail(e.to_string());
        }
    }

    if let Err(e) = store.update_job(&job) {
        log::error!("Failed to record final state of job {}: {}", job.id, e);
    }

    let mut slot = lock_slot(&active);
    if slot.as_ref().is_some_and(|run| run.job_id == job.id) {
        *slot = None;
    }
}

fn touch_job<S: JobStore + ?Sized>(store: &S, job_id: i64, pages: u32) {
    let update = || -> Result<(), StoreError> {
        if let Some(mut job) = store.find_job(job_id)?
            && !job.status.is_terminal()
        {
            job.crawled_count = pages;
            job.last_progress_at = Utc::now();
            store.update_job(&job)?;
        }
        Ok(())
    };
    if let Err(e) = update() {
        log::warn!("Failed to record progress of job {job_id}: {e}");
    }
}
