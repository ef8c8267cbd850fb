use std::fmt::Display;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;

use crate::geocoding::Geocoder;
use crate::store::{InstitutionStore, StoreError};
use crate::types::{Coordinates, CrawledRecord, Institution, NewInstitution, ReconcileSummary};

enum Applied {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub updated: u32,
    pub failed: u32,
}

impl Display for BackfillSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Coordinates updated: {} | failed: {}",
            self.updated, self.failed
        )
    }
}

/// Folds crawled records into the store, one record at a time.
pub struct Reconciler<'a, S: InstitutionStore, G: Geocoder> {
    store: &'a S,
    geocoder: &'a G,
    delay: Duration,
}

impl<'a, S: InstitutionStore, G: Geocoder> Reconciler<'a, S, G> {
    pub fn new(store: &'a S, geocoder: &'a G, delay: Duration) -> Self {
        Self {
            store,
            geocoder,
            delay,
        }
    }

    pub async fn reconcile(&self, records: &[CrawledRecord]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        log::info!("Reconciling {} record(s)", records.len());

        for (i, record) in records.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                sleep(self.delay).await;
            }

            let Some(coordinates) = self.resolve(&record.address).await else {
                log::warn!(
                    "[{}] Skipped, address could not be geocoded: '{}'",
                    record.institution_code,
                    record.address
                );
                summary.failed += 1;
                continue;
            };

            match self.apply(record, coordinates) {
                Ok(Applied::Created) => summary.created += 1,
                Ok(Applied::Updated) => {
                    summary.updated += 1;
                    summary.history_recorded += 1;
                }
                Ok(Applied::Unchanged) => {}
                Err(e) => {
                    log::warn!("[{}] Store write failed: {}", record.institution_code, e);
                    summary.failed += 1;
                }
            }
        }

        log::info!("Reconcile finished: {}", summary);
        summary
    }

    /// Re-geocodes institutions that were stored without coordinates. Only the
    /// coordinates change, so no history is written.
    pub async fn backfill_coordinates(&self, institutions: &[Institution]) -> BackfillSummary {
        let mut summary = BackfillSummary::default();
        for (i, institution) in institutions.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let Some(coordinates) = self.resolve(&institution.address).await else {
                summary.failed += 1;
                continue;
            };
            match self.store.update_coordinates(institution.id, coordinates) {
                Ok(_) => summary.updated += 1,
                Err(e) => {
                    log::warn!(
                        "[{}] Coordinate update failed: {}",
                        institution.institution_code,
                        e
                    );
                    summary.failed += 1;
                }
            }
        }
        log::info!("Coordinate backfill finished: {}", summary);
        summary
    }

    async fn resolve(&self, address: &str) -> Option<Coordinates> {
        match self.geocoder.geocode(address).await {
            Ok(coordinates) => coordinates,
            Err(e) => {
                log::warn!("Geocoding '{}' failed: {}", address, e);
                None
            }
        }
    }

    fn apply(&self, record: &CrawledRecord, coordinates: Coordinates) -> Result<Applied, StoreError> {
        let Some(existing) = self.store.find_by_code(&record.institution_code)? else {
            self.store.create(NewInstitution {
                record: record.clone(),
                coordinates,
            })?;
            log::debug!("[{}] Created", record.institution_code);
            return Ok(Applied::Created);
        };

        if !existing.differs_from(record) {
            return Ok(Applied::Unchanged);
        }

        self.store
            .record_change(&existing, record, coordinates, Utc::now())?;
        log::debug!(
            "[{}] Updated, previous state kept in history",
            record.institution_code
        );
        Ok(Applied::Updated)
    }
}
