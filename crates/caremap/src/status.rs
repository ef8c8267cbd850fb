//! The shared progress surface and the hand-off file between a crawl and an import.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::types::{CrawlProgress, CrawlStatus, CrawledRecord};

pub const STATUS_FILE: &str = "status.json";
pub const STAGED_FILE: &str = "crawled-data.json";

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed state file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy {
    pub job_id: Option<i64>,
}

/// True when nothing has been heard for longer than `window`. A timestamp from
/// the future (clock skew) counts as fresh.
pub fn is_stale(last_seen: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    match last_seen {
        None => true,
        Some(seen) => (now - seen).to_std().is_ok_and(|age| age > window),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StatusError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StatusError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| StatusError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes through a temporary file so readers never observe a half-written document.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StatusError> {
    let io_err = |source| StatusError::Io {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(value).map_err(|source| StatusError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

fn ensure_dir(dir: &Path) -> Result<(), StatusError> {
    fs::create_dir_all(dir).map_err(|source| StatusError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Single-writer, many-reader crawl status. The running flag is claimed with a
/// compare-and-set; every change is mirrored to `status.json` when persistent.
#[derive(Debug, Default)]
pub struct StatusBoard {
    running: AtomicBool,
    generation: AtomicU64,
    state: RwLock<CrawlStatus>,
    path: Option<PathBuf>,
}

impl StatusBoard {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the board under `state_dir`, seeded from an existing `status.json`.
    pub fn persistent(state_dir: &Path) -> Result<Self, StatusError> {
        ensure_dir(state_dir)?;
        let path = state_dir.join(STATUS_FILE);
        let state = read_json(&path)?.unwrap_or_default();
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            ..Default::default()
        })
    }

    /// Reads `status.json` without taking part in the run, as another process would.
    pub fn read_persisted(state_dir: &Path) -> Result<CrawlStatus, StatusError> {
        Ok(read_json(&state_dir.join(STATUS_FILE))?.unwrap_or_default())
    }

    pub fn snapshot(&self) -> CrawlStatus {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Claims the running flag. A holder that has been silent for longer than
    /// `staleness` is considered abandoned and is taken over.
    pub fn try_acquire(
        self: &Arc<Self>,
        staleness: Duration,
        now: DateTime<Utc>,
    ) -> Result<RunGuard, Busy> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let current = self.snapshot();
            if !is_stale(current.last_update, staleness, now) {
                return Err(Busy {
                    job_id: current.job_id,
                });
            }
            log::warn!(
                "Crawl {:?} has not reported since {:?}; taking over",
                current.job_id,
                current.last_update
            );
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(RunGuard {
            board: Arc::clone(self),
            generation,
            began: false,
        })
    }

    /// Clears a leftover "crawling" marker when no run is active in this process.
    pub fn reset(&self) {
        if self.is_running() {
            return;
        }
        self.publish(|status| {
            status.is_crawling = false;
            status.last_update = Some(Utc::now());
        });
    }

    fn publish(&self, update: impl FnOnce(&mut CrawlStatus)) {
        let snapshot = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            update(&mut state);
            state.clone()
        };
        if let Some(path) = &self.path
            && let Err(e) = write_json(path, &snapshot)
        {
            log::warn!("Failed to persist crawl status: {e}");
        }
    }

    fn publish_from(&self, generation: u64, update: impl FnOnce(&mut CrawlStatus)) {
        if self.generation.load(Ordering::Acquire) != generation {
            log::debug!("Ignoring status update from superseded run {generation}");
            return;
        }
        self.publish(update);
    }
}

/// Exclusive right to publish run progress. Dropping it releases the running flag.
#[derive(Debug)]
pub struct RunGuard {
    board: Arc<StatusBoard>,
    generation: u64,
    began: bool,
}

impl RunGuard {
    pub fn begin(&mut self, job_id: i64) {
        self.began = true;
        self.board.publish_from(self.generation, |status| {
            *status = CrawlStatus {
                is_crawling: true,
                job_id: Some(job_id),
                progress: None,
                error: None,
                last_update: Some(Utc::now()),
            };
        });
    }

    pub fn progress(&self, progress: CrawlProgress) {
        self.board.publish_from(self.generation, |status| {
            status.progress = Some(progress);
            status.last_update = Some(Utc::now());
        });
    }

    pub fn complete(&self, progress: CrawlProgress) {
        self.board.publish_from(self.generation, |status| {
            status.is_crawling = false;
            status.progress = Some(progress);
            status.error = None;
            status.last_update = Some(Utc::now());
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.board.publish_from(self.generation, |status| {
            status.is_crawling = false;
            status.progress = None;
            status.error = Some(message);
            status.last_update = Some(Utc::now());
        });
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.board.generation.load(Ordering::Acquire) != self.generation {
            return;
        }
        if self.began && self.board.snapshot().is_crawling {
            self.fail("Crawl ended unexpectedly");
        }
        self.board.running.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedCrawl {
    pub institutions: Vec<CrawledRecord>,
    pub timestamp: DateTime<Utc>,
    pub job_id: Option<i64>,
}

/// Holds the records of the last finished crawl until they are imported.
#[derive(Debug, Clone)]
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    pub fn new(state_dir: &Path) -> Result<Self, StatusError> {
        ensure_dir(state_dir)?;
        Ok(Self {
            path: state_dir.join(STAGED_FILE),
        })
    }

    pub fn save(&self, staged: &StagedCrawl) -> Result<(), StatusError> {
        write_json(&self.path, staged)?;
        log::info!(
            "Staged {} record(s) at {}",
            staged.institutions.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StagedCrawl>, StatusError> {
        read_json(&self.path)
    }

    pub fn clear(&self) -> Result<(), StatusError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StatusError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
