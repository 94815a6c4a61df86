use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use super::models::ReconciliationRecord;
use super::store::RecordStore;
use crate::error::AppResult;

/// Default staleness threshold in minutes.
pub const DEFAULT_STALE_MINUTES: i64 = 20;

/// Stale claim reaper.
///
/// A crashed worker or a timed-out settlement call leaves its record
/// IN_PROGRESS forever; nothing else in the system cancels in-flight work, so
/// this reset is the sole timeout mechanism. The reset is a safety measure,
/// not a failed attempt: the retry budget is untouched.
pub struct StaleClaimReaper {
    store: Arc<dyn RecordStore>,
    stale_before: DateTime<Utc>,
}

impl StaleClaimReaper {
    pub fn new(store: Arc<dyn RecordStore>, stale_before: DateTime<Utc>) -> Self {
        Self {
            store,
            stale_before,
        }
    }

    /// Reset the record if its claim has gone stale. Returns whether this
    /// caller performed the reset; a racing reaper or a fresh re-claim makes
    /// the store-side compare-and-set no-op.
    pub async fn reap(&self, record: &ReconciliationRecord) -> AppResult<bool> {
        if !record.is_stale(self.stale_before) {
            return Ok(false);
        }

        let reset = self.store.reset_stale(record.id, self.stale_before).await?;
        if reset {
            info!(
                "🧹 Stale claim reset: {} {} (last activity {:?})",
                record.kind,
                record.external_ref,
                record.last_activity()
            );
        }
        Ok(reset)
    }
}
