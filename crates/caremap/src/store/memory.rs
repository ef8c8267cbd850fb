use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{
    InstitutionFilter, InstitutionOrder, InstitutionStore, JobStore, StoreError, check_transition,
};
use crate::types::{
    Coordinates, CrawlJob, CrawledRecord, HistorySnapshot, Institution, InstitutionHistory,
    JobStatus, NewInstitution,
};

#[derive(Debug, Default)]
struct Tables {
    institutions: Vec<Institution>,
    history: Vec<InstitutionHistory>,
    jobs: Vec<CrawlJob>,
    next_institution_id: i64,
    next_history_id: i64,
    next_job_id: i64,
}

impl Tables {
    fn institution_mut(&mut self, id: i64) -> Result<&mut Institution, StoreError> {
        self.institutions
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::NotFound {
                entity: "Institution",
                id,
            })
    }

    fn push_history(
        &mut self,
        institution_id: i64,
        snapshot: &HistorySnapshot,
        recorded_date: DateTime<Utc>,
    ) -> InstitutionHistory {
        self.next_history_id += 1;
        let row = InstitutionHistory {
            id: self.next_history_id,
            institution_id,
            snapshot: snapshot.clone(),
            recorded_date,
        };
        self.history.push(row.clone());
        row
    }
}

fn apply_record(institution: &mut Institution, record: &CrawledRecord, coordinates: Coordinates) {
    institution.name = record.name.clone();
    institution.service_type = record.service_type;
    institution.address = record.address.clone();
    institution.capacity = record.capacity;
    institution.current_headcount = record.current_headcount;
    institution.latitude = coordinates.latitude;
    institution.longitude = coordinates.longitude;
    institution.updated_at = Utc::now();
}

fn matches(filter: &InstitutionFilter, institution: &Institution) -> bool {
    !filter.needs_geocoding || institution.needs_geocoding()
}

/// Process-local store backing the unit tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstitutionStore for MemoryStore {
    fn find_by_code(&self, code: &str) -> Result<Option<Institution>, StoreError> {
        Ok(self
            .tables()
            .institutions
            .iter()
            .find(|i| i.institution_code == code)
            .cloned())
    }

    fn create(&self, new: NewInstitution) -> Result<Institution, StoreError> {
        let mut tables = self.tables();
        let code = &new.record.institution_code;
        if tables.institutions.iter().any(|i| &i.institution_code == code) {
            return Err(StoreError::DuplicateCode(code.clone()));
        }

        tables.next_institution_id += 1;
        let now = Utc::now();
        let institution = Institution {
            id: tables.next_institution_id,
            institution_code: new.record.institution_code,
            name: new.record.name,
            service_type: new.record.service_type,
            address: new.record.address,
            capacity: new.record.capacity,
            current_headcount: new.record.current_headcount,
            latitude: new.coordinates.latitude,
            longitude: new.coordinates.longitude,
            created_at: now,
            updated_at: now,
        };
        tables.institutions.push(institution.clone());
        Ok(institution)
    }

    fn update(
        &self,
        id: i64,
        record: &CrawledRecord,
        coordinates: Coordinates,
    ) -> Result<Institution, StoreError> {
        let mut tables = self.tables();
        let institution = tables.institution_mut(id)?;
        apply_record(institution, record, coordinates);
        Ok(institution.clone())
    }

    fn update_coordinates(
        &self,
        id: i64,
        coordinates: Coordinates,
    ) -> Result<Institution, StoreError> {
        let mut tables = self.tables();
        let institution = tables.institution_mut(id)?;
        institution.latitude = coordinates.latitude;
        institution.longitude = coordinates.longitude;
        institution.updated_at = Utc::now();
        Ok(institution.clone())
    }

    fn append_history(
        &self,
        institution_id: i64,
        snapshot: &HistorySnapshot,
        recorded_date: DateTime<Utc>,
    ) -> Result<InstitutionHistory, StoreError> {
        let mut tables = self.tables();
        tables.institution_mut(institution_id)?;
        Ok(tables.push_history(institution_id, snapshot, recorded_date))
    }

    fn record_change(
        &self,
        existing: &Institution,
        record: &CrawledRecord,
        coordinates: Coordinates,
        recorded_date: DateTime<Utc>,
    ) -> Result<(Institution, InstitutionHistory), StoreError> {
        // One lock for both writes.
        let mut tables = self.tables();
        let stored = tables.institution_mut(existing.id)?.snapshot();
        let history = tables.push_history(existing.id, &stored, recorded_date);
        let institution = tables.institution_mut(existing.id)?;
        apply_record(institution, record, coordinates);
        Ok((institution.clone(), history))
    }

    fn history_for(&self, institution_id: i64) -> Result<Vec<InstitutionHistory>, StoreError> {
        let mut rows: Vec<InstitutionHistory> = self
            .tables()
            .history
            .iter()
            .filter(|h| h.institution_id == institution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| (h.recorded_date, h.id));
        Ok(rows)
    }

    fn count(&self, filter: &InstitutionFilter) -> Result<u64, StoreError> {
        Ok(self
            .tables()
            .institutions
            .iter()
            .filter(|i| matches(filter, i))
            .count() as u64)
    }

    fn list(
        &self,
        filter: &InstitutionFilter,
        order: InstitutionOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Institution>, StoreError> {
        let mut rows: Vec<Institution> = self
            .tables()
            .institutions
            .iter()
            .filter(|i| matches(filter, i))
            .cloned()
            .collect();
        match order {
            InstitutionOrder::CodeAsc => {
                rows.sort_by(|a, b| a.institution_code.cmp(&b.institution_code))
            }
            InstitutionOrder::UpdatedDesc => {
                rows.sort_by(|a, b| (b.updated_at, b.id).cmp(&(a.updated_at, a.id)))
            }
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

impl JobStore for MemoryStore {
    fn create_job(
        &self,
        crawler_id: Option<&str>,
        total_pages: u32,
        now: DateTime<Utc>,
    ) -> Result<CrawlJob, StoreError> {
        let mut tables = self.tables();
        tables.next_job_id += 1;
        let job = CrawlJob::new(
            tables.next_job_id,
            crawler_id.map(str::to_string),
            total_pages,
            now,
        );
        tables.jobs.push(job.clone());
        Ok(job)
    }

    fn update_job(&self, job: &CrawlJob) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let stored = tables
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or(StoreError::NotFound {
                entity: "Crawl job",
                id: job.id,
            })?;
        check_transition(stored, job)?;
        *stored = job.clone();
        Ok(())
    }

    fn find_job(&self, id: i64) -> Result<Option<CrawlJob>, StoreError> {
        Ok(self.tables().jobs.iter().find(|j| j.id == id).cloned())
    }

    fn latest_running_job(&self) -> Result<Option<CrawlJob>, StoreError> {
        Ok(self
            .tables()
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .max_by_key(|j| (j.started_at, j.id))
            .cloned())
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<CrawlJob>, StoreError> {
        let mut jobs: Vec<CrawlJob> = self
            .tables()
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (b.started_at, b.id).cmp(&(a.started_at, a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, StoreError> {
        Ok(self
            .tables()
            .jobs
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn test_create_and_find() {
        contract::create_and_find(&MemoryStore::new());
    }

    #[test]
    fn test_duplicate_code_rejected() {
        contract::duplicate_code_rejected(&MemoryStore::new());
    }

    #[test]
    fn test_record_change_writes_history_then_update() {
        contract::record_change_writes_history_then_update(&MemoryStore::new());
    }

    #[test]
    fn test_record_change_on_missing_row_leaves_no_history() {
        contract::record_change_on_missing_row_leaves_no_history(&MemoryStore::new());
    }

    #[test]
    fn test_update_overwrites_without_history() {
        contract::update_overwrites_without_history(&MemoryStore::new());
    }

    #[test]
    fn test_append_history_requires_institution() {
        contract::append_history_requires_institution(&MemoryStore::new());
    }

    #[test]
    fn test_record_change_snapshots_stored_row() {
        contract::record_change_snapshots_stored_row(&MemoryStore::new());
    }

    #[test]
    fn test_filters_and_ordering() {
        contract::filters_and_ordering(&MemoryStore::new());
    }

    #[test]
    fn test_job_lifecycle() {
        contract::job_lifecycle(&MemoryStore::new());
    }
}
