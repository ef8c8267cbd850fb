use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
#[error(
    "Invalid service type '{0}'. Accepted values: '노인요양시설', '주야간보호', '방문요양', '단기보호', '치매전담형'"
)]
pub struct ServiceTypeParseError(String);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    #[serde(rename = "노인요양시설")]
    NursingHome,
    #[serde(rename = "주야간보호")]
    DayNightCare,
    #[serde(rename = "방문요양")]
    HomeVisitCare,
    #[serde(rename = "단기보호")]
    ShortTermCare,
    #[serde(rename = "치매전담형")]
    DementiaCare,
}

impl ServiceType {
    pub fn label(&self) -> &'static str {
        match self {
            ServiceType::NursingHome => "노인요양시설",
            ServiceType::DayNightCare => "주야간보호",
            ServiceType::HomeVisitCare => "방문요양",
            ServiceType::ShortTermCare => "단기보호",
            ServiceType::DementiaCare => "치매전담형",
        }
    }
}

impl FromStr for ServiceType {
    type Err = ServiceTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "노인요양시설" => Ok(ServiceType::NursingHome),
            "주야간보호" => Ok(ServiceType::DayNightCare),
            "방문요양" => Ok(ServiceType::HomeVisitCare),
            "단기보호" => Ok(ServiceType::ShortTermCare),
            "치매전담형" => Ok(ServiceType::DementiaCare),
            _ => Err(ServiceTypeParseError(s.to_string())),
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A single registry row as scraped from one results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawledRecord {
    pub institution_code: String,
    pub name: String,
    pub service_type: ServiceType,
    pub address: String,
    pub capacity: u32,
    pub current_headcount: u32,
}

impl Display for CrawledRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} | {} | 정원:{} 현원:{} | {}",
            self.institution_code,
            self.name,
            self.service_type,
            self.capacity,
            self.current_headcount,
            self.address
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Institution {
    pub id: i64,
    pub institution_code: String,
    pub name: String,
    pub service_type: ServiceType,
    pub address: String,
    pub capacity: u32,
    pub current_headcount: u32,
    pub latitude: f64,
    pub longitude: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Institution {
    pub fn needs_geocoding(&self) -> bool {
        self.latitude == 0.0 || self.longitude == 0.0
    }

    /// True when any tracked business field differs from the crawled values.
    pub fn differs_from(&self, record: &CrawledRecord) -> bool {
        self.name != record.name
            || self.address != record.address
            || self.capacity != record.capacity
            || self.current_headcount != record.current_headcount
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            name: self.name.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            current_headcount: self.current_headcount,
        }
    }
}

impl Display for Institution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} [{}] {} ({}) 정원:{} 현원:{} @ ({:.6}, {:.6})",
            self.id,
            self.institution_code,
            self.name,
            self.service_type,
            self.capacity,
            self.current_headcount,
            self.latitude,
            self.longitude
        )
    }
}

#[derive(Debug, Clone)]
pub struct NewInstitution {
    pub record: CrawledRecord,
    pub coordinates: Coordinates,
}

/// The business fields of an institution as they were before an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySnapshot {
    pub name: String,
    pub address: String,
    pub capacity: u32,
    pub current_headcount: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstitutionHistory {
    pub id: i64,
    pub institution_id: i64,
    #[serde(flatten)]
    pub snapshot: HistorySnapshot,
    pub recorded_date: DateTime<Utc>,
}

impl Display for InstitutionHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} — {} | 정원:{} 현원:{} | {}",
            self.recorded_date.format("%Y-%m-%d %H:%M:%S"),
            self.snapshot.name,
            self.snapshot.capacity,
            self.snapshot.current_headcount,
            self.snapshot.address
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid job status '{0}'. Accepted values: 'running', 'completed', 'failed'")]
pub struct JobStatusParseError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl FromStr for JobStatus {
    type Err = JobStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(JobStatusParseError(s.to_string())),
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlJob {
    pub id: i64,
    pub crawler_id: Option<String>,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_progress_at: DateTime<Utc>,
    pub total_pages: u32,
    pub crawled_count: u32,
    pub created_count: u32,
    pub updated_count: u32,
    pub failed_count: u32,
    pub saved_to_db: bool,
    pub error_message: Option<String>,
}

impl CrawlJob {
    pub fn new(id: i64, crawler_id: Option<String>, total_pages: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            crawler_id,
            status: JobStatus::Running,
            started_at: now,
            completed_at: None,
            last_progress_at: now,
            total_pages,
            crawled_count: 0,
            created_count: 0,
            updated_count: 0,
            failed_count: 0,
            saved_to_db: false,
            error_message: None,
        }
    }

    pub fn complete(&mut self, crawled_count: u32, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.crawled_count = crawled_count;
        self.completed_at = Some(now);
        self.last_progress_at = now;
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        self.last_progress_at = now;
    }
}

impl Display for CrawlJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job #{} [{}] started {} | pages:{} crawled:{}",
            self.id,
            self.status,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.total_pages,
            self.crawled_count
        )?;
        if self.saved_to_db {
            write!(
                f,
                " | saved (created:{} updated:{} failed:{})",
                self.created_count, self.updated_count, self.failed_count
            )?;
        }
        if let Some(err) = &self.error_message {
            write!(f, " | error: {}", err)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub current: u32,
    pub total: u32,
    pub percentage: u8,
    pub message: String,
}

impl CrawlProgress {
    pub fn new(current: u32, total: u32, percentage: u8, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            percentage: percentage.min(100),
            message: message.into(),
        }
    }
}

impl Display for CrawlProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:>3}%] {}/{} — {}",
            self.percentage, self.current, self.total, self.message
        )
    }
}

/// The polled status surface shared with readers in this and other processes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlStatus {
    pub is_crawling: bool,
    pub job_id: Option<i64>,
    pub progress: Option<CrawlProgress>,
    pub error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Display for CrawlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.is_crawling { "crawling" } else { "idle" };
        write!(f, "{}", state)?;
        if let Some(job_id) = self.job_id {
            write!(f, " (job #{})", job_id)?;
        }
        if let Some(progress) = &self.progress {
            write!(f, " {}", progress)?;
        }
        if let Some(err) = &self.error {
            write!(f, " | error: {}", err)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub created: u32,
    pub updated: u32,
    pub history_recorded: u32,
    pub failed: u32,
}

impl Display for ReconcileSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} history recorded, {} failed",
            self.created, self.updated, self.history_recorded, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_round_trips_through_label() {
        for st in [
            ServiceType::NursingHome,
            ServiceType::DayNightCare,
            ServiceType::HomeVisitCare,
            ServiceType::ShortTermCare,
            ServiceType::DementiaCare,
        ] {
            assert_eq!(st.label().parse::<ServiceType>().unwrap(), st);
        }
        assert!("요양병원".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_crawled_record_json_uses_camel_case() {
        let record = CrawledRecord {
            institution_code: "LTCO_000001".into(),
            name: "한솔노인복지센터".into(),
            service_type: ServiceType::DayNightCare,
            address: "서울특별시 강남구".into(),
            capacity: 30,
            current_headcount: 25,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["institutionCode"], "LTCO_000001");
        assert_eq!(json["serviceType"], "주야간보호");
        assert_eq!(json["currentHeadcount"], 25);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
    }

    #[test]
    fn test_progress_percentage_is_clamped() {
        assert_eq!(CrawlProgress::new(1, 1, 150, "done").percentage, 100);
    }
}
