//! Persistence for institutions, their change history and crawl jobs.

#[cfg(test)]
mod memory;
mod sqlite;

#[cfg(test)]
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

use crate::types::{
    Coordinates, CrawlJob, CrawledRecord, HistorySnapshot, Institution, InstitutionHistory,
    JobStatus, NewInstitution,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("Institution {0} already exists")]
    DuplicateCode(String),
    #[error("Job {id} is already {status}")]
    TerminalJob { id: i64, status: JobStatus },
}

#[derive(Debug, Clone, Default)]
pub struct InstitutionFilter {
    /// Only institutions with a zero latitude or longitude.
    pub needs_geocoding: bool,
}

impl InstitutionFilter {
    pub fn needs_geocoding() -> Self {
        Self {
            needs_geocoding: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstitutionOrder {
    #[default]
    CodeAsc,
    UpdatedDesc,
}

pub trait InstitutionStore: Send + Sync {
    fn find_by_code(&self, code: &str) -> Result<Option<Institution>, StoreError>;

    fn create(&self, new: NewInstitution) -> Result<Institution, StoreError>;

    /// Overwrites business fields and coordinates. Does not write history.
    fn update(
        &self,
        id: i64,
        record: &CrawledRecord,
        coordinates: Coordinates,
    ) -> Result<Institution, StoreError>;

    fn update_coordinates(&self, id: i64, coordinates: Coordinates)
    -> Result<Institution, StoreError>;

    fn append_history(
        &self,
        institution_id: i64,
        snapshot: &HistorySnapshot,
        recorded_date: DateTime<Utc>,
    ) -> Result<InstitutionHistory, StoreError>;

    /// Writes the pre-change snapshot and then the update as one unit: either
    /// both land or neither does. The snapshot is read from the stored row, so a
    /// stale `existing` cannot put the wrong prior state into history.
    fn record_change(
        &self,
        existing: &Institution,
        record: &CrawledRecord,
        coordinates: Coordinates,
        recorded_date: DateTime<Utc>,
    ) -> Result<(Institution, InstitutionHistory), StoreError>;

    /// History rows of one institution, oldest first.
    fn history_for(&self, institution_id: i64) -> Result<Vec<InstitutionHistory>, StoreError>;

    fn count(&self, filter: &InstitutionFilter) -> Result<u64, StoreError>;

    fn list(
        &self,
        filter: &InstitutionFilter,
        order: InstitutionOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Institution>, StoreError>;
}

pub trait JobStore: Send + Sync {
    fn create_job(
        &self,
        crawler_id: Option<&str>,
        total_pages: u32,
        now: DateTime<Utc>,
    ) -> Result<CrawlJob, StoreError>;

    /// Persists every field of `job`. A terminal job cannot change status again.
    fn update_job(&self, job: &CrawlJob) -> Result<(), StoreError>;

    fn find_job(&self, id: i64) -> Result<Option<CrawlJob>, StoreError>;

    fn latest_running_job(&self) -> Result<Option<CrawlJob>, StoreError>;

    /// Newest first.
    fn list_jobs(&self, status: Option<JobStatus>, limit: usize)
    -> Result<Vec<CrawlJob>, StoreError>;

    fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, StoreError>;
}

fn check_transition(stored: &CrawlJob, next: &CrawlJob) -> Result<(), StoreError> {
    if stored.status.is_terminal() && stored.status != next.status {
        return Err(StoreError::TerminalJob {
            id: stored.id,
            status: stored.status,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every store implementation must share.

    use super::*;
    use crate::test_support::{coords, record};
    use chrono::TimeDelta;

    pub fn create_and_find<S: InstitutionStore>(store: &S) {
        assert!(store.find_by_code("LTCO_000001").unwrap().is_none());

        let created = store
            .create(NewInstitution {
                record: record(1, 25),
                coordinates: coords(37.5665, 126.978),
            })
            .unwrap();
        let found = store.find_by_code("LTCO_000001").unwrap().unwrap();

        assert_eq!(found, created);
        assert_eq!(found.current_headcount, 25);
        assert_eq!(found.latitude, 37.5665);
        assert!(!found.needs_geocoding());
    }

    pub fn duplicate_code_rejected<S: InstitutionStore>(store: &S) {
        let new = NewInstitution {
            record: record(7, 10),
            coordinates: coords(35.1, 129.0),
        };
        store.create(new.clone()).unwrap();

        let err = store.create(new).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCode(code) if code == "LTCO_000007"));
    }

    pub fn record_change_writes_history_then_update<S: InstitutionStore>(store: &S) {
        let inst = store
            .create(NewInstitution {
                record: record(1, 25),
                coordinates: coords(37.5, 127.0),
            })
            .unwrap();
        let start = Utc::now();

        let (updated, history) = store
            .record_change(&inst, &record(1, 28), coords(37.6, 127.1), start)
            .unwrap();
        assert_eq!(updated.current_headcount, 28);
        assert_eq!(updated.latitude, 37.6);
        assert_eq!(history.snapshot.current_headcount, 25);
        assert_eq!(history.institution_id, inst.id);

        let (_, second) = store
            .record_change(&updated, &record(1, 31), coords(37.6, 127.1), start + TimeDelta::seconds(5))
            .unwrap();
        assert_eq!(second.snapshot.current_headcount, 28);

        let rows = store.history_for(inst.id).unwrap();
        let headcounts: Vec<u32> = rows.iter().map(|h| h.snapshot.current_headcount).collect();
        assert_eq!(headcounts, vec![25, 28]);
        assert!(rows[0].recorded_date <= rows[1].recorded_date);
    }

    pub fn record_change_on_missing_row_leaves_no_history<S: InstitutionStore>(store: &S) {
        let inst = store
            .create(NewInstitution {
                record: record(2, 5),
                coordinates: coords(37.5, 127.0),
            })
            .unwrap();
        let ghost = Institution {
            id: inst.id + 1000,
            ..inst
        };

        let err = store
            .record_change(&ghost, &record(2, 6), coords(37.5, 127.0), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.history_for(ghost.id).unwrap().is_empty());
    }

    pub fn update_overwrites_without_history<S: InstitutionStore>(store: &S) {
        let inst = store
            .create(NewInstitution {
                record: record(4, 12),
                coordinates: coords(0.0, 0.0),
            })
            .unwrap();
        let mut renamed = record(4, 15);
        renamed.name = "기관4 본점".to_string();

        let updated = store.update(inst.id, &renamed, coords(36.3, 127.4)).unwrap();

        assert_eq!(updated.id, inst.id);
        assert_eq!(updated.name, "기관4 본점");
        assert_eq!(updated.current_headcount, 15);
        assert_eq!(updated.longitude, 127.4);
        assert!(updated.updated_at >= inst.updated_at);
        assert_eq!(store.find_by_code("LTCO_000004").unwrap().unwrap(), updated);
        assert!(store.history_for(inst.id).unwrap().is_empty());

        let err = store
            .update(inst.id + 1000, &renamed, coords(36.3, 127.4))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    pub fn append_history_requires_institution<S: InstitutionStore>(store: &S) {
        let inst = store
            .create(NewInstitution {
                record: record(5, 8),
                coordinates: coords(37.5, 127.0),
            })
            .unwrap();
        let recorded = Utc::now();

        let row = store
            .append_history(inst.id, &inst.snapshot(), recorded)
            .unwrap();
        assert_eq!(row.institution_id, inst.id);
        assert_eq!(row.snapshot, inst.snapshot());
        let rows = store.history_for(inst.id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, row.id);
        assert_eq!(rows[0].snapshot.current_headcount, 8);

        let err = store
            .append_history(inst.id + 1000, &inst.snapshot(), recorded)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(store.history_for(inst.id + 1000).unwrap().is_empty());
    }

    pub fn record_change_snapshots_stored_row<S: InstitutionStore>(store: &S) {
        let read_earlier = store
            .create(NewInstitution {
                record: record(6, 20),
                coordinates: coords(37.5, 127.0),
            })
            .unwrap();
        store
            .update(read_earlier.id, &record(6, 22), coords(37.5, 127.0))
            .unwrap();

        let (updated, history) = store
            .record_change(&read_earlier, &record(6, 24), coords(37.5, 127.0), Utc::now())
            .unwrap();

        assert_eq!(history.snapshot.current_headcount, 22);
        assert_eq!(updated.current_headcount, 24);
    }

    pub fn filters_and_ordering<S: InstitutionStore>(store: &S) {
        for (index, lat) in [(3, 0.0), (1, 37.5), (2, 0.0)] {
            store
                .create(NewInstitution {
                    record: record(index, 1),
                    coordinates: coords(lat, 127.0),
                })
                .unwrap();
        }

        assert_eq!(store.count(&InstitutionFilter::default()).unwrap(), 3);
        assert_eq!(store.count(&InstitutionFilter::needs_geocoding()).unwrap(), 2);

        let pending = store
            .list(&InstitutionFilter::needs_geocoding(), InstitutionOrder::CodeAsc, None)
            .unwrap();
        let codes: Vec<&str> = pending.iter().map(|i| i.institution_code.as_str()).collect();
        assert_eq!(codes, vec!["LTCO_000002", "LTCO_000003"]);

        let limited = store
            .list(&InstitutionFilter::default(), InstitutionOrder::CodeAsc, Some(1))
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].institution_code, "LTCO_000001");

        let fixed = store
            .update_coordinates(pending[0].id, coords(35.0, 128.0))
            .unwrap();
        assert!(!fixed.needs_geocoding());
        assert_eq!(store.count(&InstitutionFilter::needs_geocoding()).unwrap(), 1);

        let recent = store
            .list(&InstitutionFilter::default(), InstitutionOrder::UpdatedDesc, Some(1))
            .unwrap();
        assert_eq!(recent[0].institution_code, "LTCO_000002");
    }

    pub fn job_lifecycle<S: JobStore>(store: &S) {
        let now = Utc::now();
        let mut first = store.create_job(Some("nightly"), 10, now).unwrap();
        let second = store
            .create_job(None, 5, now + TimeDelta::seconds(1))
            .unwrap();
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(store.latest_running_job().unwrap().unwrap().id, second.id);

        first.crawled_count = 4;
        first.complete(40, now + TimeDelta::seconds(30));
        store.update_job(&first).unwrap();

        let stored = store.find_job(first.id).unwrap().unwrap();
        assert_eq!(stored, first);
        assert_eq!(stored.crawler_id.as_deref(), Some("nightly"));

        let mut saved = stored.clone();
        saved.saved_to_db = true;
        saved.created_count = 40;
        store.update_job(&saved).unwrap();

        let mut reopened = saved.clone();
        reopened.fail("late failure", now + TimeDelta::seconds(60));
        let err = store.update_job(&reopened).unwrap_err();
        assert!(matches!(err, StoreError::TerminalJob { status: JobStatus::Completed, .. }));

        let jobs = store.list_jobs(None, 10).unwrap();
        assert_eq!(jobs.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second.id, first.id]);
        assert_eq!(store.list_jobs(Some(JobStatus::Completed), 10).unwrap().len(), 1);
        assert_eq!(store.count_jobs(Some(JobStatus::Running)).unwrap(), 1);
        assert_eq!(store.count_jobs(None).unwrap(), 2);
        assert!(store.find_job(999).unwrap().is_none());
    }
}
