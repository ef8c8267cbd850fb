use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};

use super::{
    InstitutionFilter, InstitutionOrder, InstitutionStore, JobStore, StoreError, check_transition,
};
use crate::types::{
    Coordinates, CrawlJob, CrawledRecord, HistorySnapshot, Institution, InstitutionHistory,
    JobStatus, NewInstitution,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS institutions (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    institution_code  TEXT NOT NULL UNIQUE,
    name              TEXT NOT NULL,
    service_type      TEXT NOT NULL,
    address           TEXT NOT NULL,
    capacity          INTEGER NOT NULL DEFAULT 0,
    current_headcount INTEGER NOT NULL DEFAULT 0,
    latitude          REAL NOT NULL DEFAULT 0,
    longitude         REAL NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS institution_history (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    institution_id    INTEGER NOT NULL REFERENCES institutions(id) ON DELETE CASCADE,
    name              TEXT NOT NULL,
    address           TEXT NOT NULL,
    capacity          INTEGER NOT NULL,
    current_headcount INTEGER NOT NULL,
    recorded_date     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_institution
    ON institution_history(institution_id, recorded_date);

CREATE TABLE IF NOT EXISTS crawl_jobs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    crawler_id       TEXT,
    status           TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    completed_at     TEXT,
    last_progress_at TEXT NOT NULL,
    total_pages      INTEGER NOT NULL DEFAULT 0,
    crawled_count    INTEGER NOT NULL DEFAULT 0,
    created_count    INTEGER NOT NULL DEFAULT 0,
    updated_count    INTEGER NOT NULL DEFAULT 0,
    failed_count     INTEGER NOT NULL DEFAULT 0,
    saved_to_db      INTEGER NOT NULL DEFAULT 0,
    error_message    TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON crawl_jobs(status, started_at);
";

const INSTITUTION_COLUMNS: &str = "id, institution_code, name, service_type, address, capacity, \
     current_headcount, latitude, longitude, created_at, updated_at";

const HISTORY_COLUMNS: &str =
    "id, institution_id, name, address, capacity, current_headcount, recorded_date";

const JOB_COLUMNS: &str = "id, crawler_id, status, started_at, completed_at, last_progress_at, \
     total_pages, crawled_count, created_count, updated_count, failed_count, saved_to_db, \
     error_message";

const FILTER_CLAUSE: &str = "(?1 = 0 OR latitude = 0 OR longitude = 0)";

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn institution_from_row(row: &Row<'_>) -> rusqlite::Result<Institution> {
    Ok(Institution {
        id: row.get(0)?,
        institution_code: row.get(1)?,
        name: row.get(2)?,
        service_type: parse_column(row, 3)?,
        address: row.get(4)?,
        capacity: row.get(5)?,
        current_headcount: row.get(6)?,
        latitude: row.get(7)?,
        longitude: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<InstitutionHistory> {
    Ok(InstitutionHistory {
        id: row.get(0)?,
        institution_id: row.get(1)?,
        snapshot: HistorySnapshot {
            name: row.get(2)?,
            address: row.get(3)?,
            capacity: row.get(4)?,
            current_headcount: row.get(5)?,
        },
        recorded_date: row.get(6)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlJob> {
    Ok(CrawlJob {
        id: row.get(0)?,
        crawler_id: row.get(1)?,
        status: parse_column(row, 2)?,
        started_at: row.get(3)?,
        completed_at: row.get(4)?,
        last_progress_at: row.get(5)?,
        total_pages: row.get(6)?,
        crawled_count: row.get(7)?,
        created_count: row.get(8)?,
        updated_count: row.get(9)?,
        failed_count: row.get(10)?,
        saved_to_db: row.get(11)?,
        error_message: row.get(12)?,
    })
}

fn not_found(entity: &'static str, id: i64) -> StoreError {
    StoreError::NotFound { entity, id }
}

fn select_institution(conn: &Connection, id: i64) -> Result<Institution, StoreError> {
    conn.query_row(
        &format!("SELECT {INSTITUTION_COLUMNS} FROM institutions WHERE id = ?1"),
        [id],
        institution_from_row,
    )
    .optional()?
    .ok_or_else(|| not_found("Institution", id))
}

fn insert_history(
    conn: &Connection,
    institution_id: i64,
    snapshot: &HistorySnapshot,
    recorded_date: DateTime<Utc>,
) -> Result<InstitutionHistory, StoreError> {
    conn.execute(
        "INSERT INTO institution_history
             (institution_id, name, address, capacity, current_headcount, recorded_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            institution_id,
            snapshot.name,
            snapshot.address,
            snapshot.capacity,
            snapshot.current_headcount,
            recorded_date,
        ],
    )?;
    Ok(InstitutionHistory {
        id: conn.last_insert_rowid(),
        institution_id,
        snapshot: snapshot.clone(),
        recorded_date,
    })
}

fn write_record(
    conn: &Connection,
    id: i64,
    record: &CrawledRecord,
    coordinates: Coordinates,
) -> Result<Institution, StoreError> {
    let changed = conn.execute(
        "UPDATE institutions
         SET name = ?2, service_type = ?3, address = ?4, capacity = ?5,
             current_headcount = ?6, latitude = ?7, longitude = ?8, updated_at = ?9
         WHERE id = ?1",
        params![
            id,
            record.name,
            record.service_type.label(),
            record.address,
            record.capacity,
            record.current_headcount,
            coordinates.latitude,
            coordinates.longitude,
            Utc::now(),
        ],
    )?;
    if changed == 0 {
        return Err(not_found("Institution", id));
    }
    select_institution(conn, id)
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        log::info!("Opening database {}", path.display());
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InstitutionStore for SqliteStore {
    fn find_by_code(&self, code: &str) -> Result<Option<Institution>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {INSTITUTION_COLUMNS} FROM institutions WHERE institution_code = ?1"),
                [code],
                institution_from_row,
            )
            .optional()?)
    }

    fn create(&self, new: NewInstitution) -> Result<Institution, StoreError> {
        let conn = self.conn();
        let now = Utc::now();
        let record = &new.record;
        let inserted = conn.execute(
            "INSERT INTO institutions
                 (institution_code, name, service_type, address, capacity, current_headcount,
                  latitude, longitude, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                record.institution_code,
                record.name,
                record.service_type.label(),
                record.address,
                record.capacity,
                record.current_headcount,
                new.coordinates.latitude,
                new.coordinates.longitude,
                now,
            ],
        );
        match inserted {
            Ok(_) => select_institution(&conn, conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateCode(record.institution_code.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(
        &self,
        id: i64,
        record: &CrawledRecord,
        coordinates: Coordinates,
    ) -> Result<Institution, StoreError> {
        write_record(&self.conn(), id, record, coordinates)
    }

    fn update_coordinates(
        &self,
        id: i64,
        coordinates: Coordinates,
    ) -> Result<Institution, StoreError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE institutions SET latitude = ?2, longitude = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, coordinates.latitude, coordinates.longitude, Utc::now()],
        )?;
        if changed == 0 {
            return Err(not_found("Institution", id));
        }
        select_institution(&conn, id)
    }

    fn append_history(
        &self,
        institution_id: i64,
        snapshot: &HistorySnapshot,
        recorded_date: DateTime<Utc>,
    ) -> Result<InstitutionHistory, StoreError> {
        let conn = self.conn();
        select_institution(&conn, institution_id)?;
        insert_history(&conn, institution_id, snapshot, recorded_date)
    }

    fn record_change(
        &self,
        existing: &Institution,
        record: &CrawledRecord,
        coordinates: Coordinates,
        recorded_date: DateTime<Utc>,
    ) -> Result<(Institution, InstitutionHistory), StoreError> {
        let mut conn = self.conn();
        // Dropping the transaction on an early return rolls back the history row.
        let tx = conn.transaction()?;
        let stored = select_institution(&tx, existing.id)?;
        let history = insert_history(&tx, existing.id, &stored.snapshot(), recorded_date)?;
        let institution = write_record(&tx, existing.id, record, coordinates)?;
        tx.commit()?;
        Ok((institution, history))
    }

    fn history_for(&self, institution_id: i64) -> Result<Vec<InstitutionHistory>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM institution_history
             WHERE institution_id = ?1
             ORDER BY recorded_date ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map([institution_id], history_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn count(&self, filter: &InstitutionFilter) -> Result<u64, StoreError> {
        let count: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM institutions WHERE {FILTER_CLAUSE}"),
            [filter.needs_geocoding],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn list(
        &self,
        filter: &InstitutionFilter,
        order: InstitutionOrder,
        limit: Option<usize>,
    ) -> Result<Vec<Institution>, StoreError> {
        let order_by = match order {
            InstitutionOrder::CodeAsc => "institution_code ASC",
            InstitutionOrder::UpdatedDesc => "updated_at DESC, id DESC",
        };
        // SQLite treats a negative LIMIT as unbounded.
        let limit = limit.map_or(-1, |l| l as i64);

        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTITUTION_COLUMNS} FROM institutions
             WHERE {FILTER_CLAUSE}
             ORDER BY {order_by}
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(
                params![filter.needs_geocoding, limit],
                institution_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl JobStore for SqliteStore {
    fn create_job(
        &self,
        crawler_id: Option<&str>,
        total_pages: u32,
        now: DateTime<Utc>,
    ) -> Result<CrawlJob, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO crawl_jobs (crawler_id, status, started_at, last_progress_at, total_pages)
             VALUES (?1, ?2, ?3, ?3, ?4)",
            params![crawler_id, JobStatus::Running.as_str(), now, total_pages],
        )?;
        Ok(CrawlJob::new(
            conn.last_insert_rowid(),
            crawler_id.map(str::to_string),
            total_pages,
            now,
        ))
    }

    fn update_job(&self, job: &CrawlJob) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let stored = tx
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
                [job.id],
                job_from_row,
            )
            .optional()?
            .ok_or_else(|| not_found("Crawl job", job.id))?;
        check_transition(&stored, job)?;

        tx.execute(
            "UPDATE crawl_jobs
             SET crawler_id = ?2, status = ?3, completed_at = ?4, last_progress_at = ?5,
                 total_pages = ?6, crawled_count = ?7, created_count = ?8, updated_count = ?9,
                 failed_count = ?10, saved_to_db = ?11, error_message = ?12
             WHERE id = ?1",
            params![
                job.id,
                job.crawler_id,
                job.status.as_str(),
                job.completed_at,
                job.last_progress_at,
                job.total_pages,
                job.crawled_count,
                job.created_count,
                job.updated_count,
                job.failed_count,
                job.saved_to_db,
                job.error_message,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn find_job(&self, id: i64) -> Result<Option<CrawlJob>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = ?1"),
                [id],
                job_from_row,
            )
            .optional()?)
    }

    fn latest_running_job(&self) -> Result<Option<CrawlJob>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE status = ?1
                     ORDER BY started_at DESC, id DESC LIMIT 1"
                ),
                [JobStatus::Running.as_str()],
                job_from_row,
            )
            .optional()?)
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<CrawlJob>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY started_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(
                params![status.map(|s| s.as_str()), limit as i64],
                job_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM crawl_jobs WHERE (?1 IS NULL OR status = ?1)",
            params![status.map(|s| s.as_str())],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
