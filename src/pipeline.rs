use serde::Serialize;
use tracing::{info, warn};

use crate::acquisition::{Acquisition, CandidateFilter, SearchLimits};
use crate::error::{AcquisitionError, Result};
use crate::models::{SearchParams, SearchQuery};
use crate::store::Store;

/// Result of one search run. Pages stored before a failure stay stored.
#[derive(Debug, Serialize)]
pub struct SearchReport {
    pub search: SearchQuery,
    pub inserted: usize,
    pub deduped: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub pages: u32,
    #[serde(skip)]
    pub error: Option<AcquisitionError>,
}

/// Runs a search end to end: acquisition, then persistence page by page.
pub struct Pipeline<'a> {
    acquisition: &'a Acquisition,
    store: &'a Store,
}

impl<'a> Pipeline<'a> {
    pub fn new(acquisition: &'a Acquisition, store: &'a Store) -> Self {
        Self { acquisition, store }
    }

    /// Create the search, store each fetched page and close the search.
    ///
    /// `filter` is extended with the query's experience bounds when it sets
    /// none of its own.
    pub fn run_search(&self, params: &SearchParams, limits: SearchLimits, filter: CandidateFilter) -> Result<SearchReport> {
        let search = self.store.create_search(params)?;
        let filter = CandidateFilter {
            experience_min: filter.experience_min.or(search.experience_min),
            experience_max: filter.experience_max.or(search.experience_max),
            ..filter
        };

        let mut report = SearchReport {
            search: search.clone(),
            inserted: 0,
            deduped: 0,
            skipped: 0,
            filtered: 0,
            pages: 0,
            error: None,
        };

        let mut stream = match self.acquisition.search(&search, limits, filter) {
            Ok(stream) => stream,
            Err(err) => {
                // Nothing was fetched; the search stays closed at its start page.
                self.store.close_search(search.id, search.next_page)?;
                return Err(err);
            }
        };

        while let Some(page) = stream.next_page() {
            match page {
                Ok(batch) => {
                    if batch.records.is_empty() {
                        continue;
                    }
                    match self.store.add_candidates(search.id, &batch.records) {
                        Ok(summary) => {
                            report.inserted += summary.inserted;
                            report.deduped += summary.deduped;
                        }
                        Err(err) => {
                            warn!(search_id = search.id, error = %err, "storing page failed");
                            if let Err(close_err) = self.store.close_search(search.id, stream.cursor()) {
                                warn!(search_id = search.id, error = %close_err, "could not close search");
                            }
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    warn!(search_id = search.id, error = %err, "acquisition stopped early");
                    report.error = Some(err);
                }
            }
        }

        let stats = stream.stats();
        report.skipped = stats.skipped;
        report.filtered = stats.filtered;
        report.pages = stats.pages_fetched;
        report.search = self.store.close_search(search.id, stream.cursor())?;

        info!(
            search_id = search.id,
            pages = report.pages,
            inserted = report.inserted,
            deduped = report.deduped,
            "search finished"
        );
        Ok(report)
    }
}
