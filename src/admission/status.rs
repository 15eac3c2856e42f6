use std::sync::Arc;

use crate::config::AdmissionConfig;
use crate::model::*;
use crate::observability;
use crate::store::SlotStore;

use super::{AdmissionError, StatusResult};

/// Read-only occupancy for waiting callers. Advisory: `can_enter` may be stale by the time
/// the caller retries, and the retry still goes through the allocator.
pub struct StatusReporter {
    store: Arc<dyn SlotStore>,
    config: Arc<AdmissionConfig>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn SlotStore>, config: Arc<AdmissionConfig>) -> Self {
        Self { store, config }
    }

    pub async fn status(
        &self,
        resource_id: &ResourceId,
        token: Option<&Token>,
        now: Ms,
    ) -> Result<StatusResult, AdmissionError> {
        metrics::counter!(observability::STATUS_QUERIES_TOTAL).increment(1);
        if !self.config.enabled {
            return Ok(StatusResult::open(self.config.capacity));
        }

        let usage = self.store.usage(resource_id, token, now).await?;
        Ok(StatusResult {
            active: usage.active,
            capacity: self.config.capacity,
            can_enter: usage.owned.is_some() || usage.active < self.config.capacity,
        })
    }
}
