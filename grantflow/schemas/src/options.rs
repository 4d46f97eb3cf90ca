//! Typed run options
//!
//! Every recognized knob for a run is enumerated here; there is no
//! pass-through of unvalidated key/value options.

use serde::{Deserialize, Serialize};

/// Options controlling one orchestrated run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Clear terminal execution history for the (entity, year) pair before
    /// starting. Canonical rows are never touched.
    pub cleanup_before: bool,
    /// Record that an external backup should accompany this run
    pub create_backup: bool,
    /// Extract the selected sources concurrently instead of sequentially
    pub parallel: bool,
    /// Upper bound on concurrently extracting sources when `parallel`
    pub workers: usize,
    /// Page size requested from the upstream sources
    pub batch_size: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cleanup_before: false,
            create_backup: false,
            parallel: false,
            workers: 4,
            batch_size: 5000,
        }
    }
}

impl RunOptions {
    /// Effective worker count: at least one, and one when sequential
    pub fn effective_workers(&self) -> usize {
        if self.parallel {
            self.workers.max(1)
        } else {
            1
        }
    }
}
