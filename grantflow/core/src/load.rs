//! Dedup/load engine
//!
//! Takes raw record batches straight off the extraction stream, maps them
//! through the transformer and bulk-upserts them with insert-ignore
//! semantics on the (source id, grant date, regime) dedup key. Existing rows
//! are never updated and never deleted; re-loading the same batch is a
//! no-op.

use std::sync::Arc;

use grantflow_schemas::RegimeTag;
use grantflow_storage::Store;
use tracing::{debug, instrument, warn};

use crate::transform::transform_record;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Storage(#[from] grantflow_storage::Error),
}

/// Outcome of one batch load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Rows actually written
    pub inserted: u64,
    /// Well-formed rows dropped by the unique constraint
    pub skipped_duplicates: u64,
    /// Malformed records excluded from the batch
    pub failed: u64,
}

impl LoadOutcome {
    /// Records that entered the engine, malformed ones included
    pub fn processed(&self) -> u64 {
        self.inserted + self.skipped_duplicates + self.failed
    }
}

/// Maps raw records to the canonical schema and performs idempotent upserts
#[derive(Clone)]
pub struct DedupLoader {
    store: Arc<dyn Store>,
}

impl DedupLoader {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Load one batch of raw records under the given regime tag.
    ///
    /// A malformed record is counted as failed and excluded rather than
    /// aborting the batch; a storage failure aborts the whole batch.
    #[instrument(skip(self, raw_records), fields(batch = raw_records.len(), regime = %regime))]
    pub async fn load_batch(
        &self,
        raw_records: &[serde_json::Value],
        regime: RegimeTag,
    ) -> Result<LoadOutcome, LoadError> {
        let mut canonical = Vec::with_capacity(raw_records.len());
        let mut failed = 0;

        for raw in raw_records {
            match transform_record(raw, regime) {
                Ok(record) => canonical.push(record),
                Err(error) => {
                    warn!(%error, "Dropping malformed record");
                    failed += 1;
                }
            }
        }

        let inserted = self.store.insert_ignore_concessions(&canonical).await?;
        let outcome = LoadOutcome {
            inserted,
            skipped_duplicates: canonical.len() as u64 - inserted,
            failed,
        };

        debug!(
            inserted = outcome.inserted,
            skipped = outcome.skipped_duplicates,
            failed = outcome.failed,
            "Batch loaded"
        );
        Ok(outcome)
    }
}
