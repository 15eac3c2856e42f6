use std::sync::Arc;

use tracing::debug;

use crate::config::AdmissionConfig;
use crate::model::*;
use crate::observability;
use crate::store::{ClaimOutcome, ClaimRequest, SlotStore};

use super::{AcquireResult, AdmissionError, DenyReason};

/// Grants slots: renew what the caller already holds, else race for a free or expired index.
pub struct SlotAllocator {
    store: Arc<dyn SlotStore>,
    config: Arc<AdmissionConfig>,
}

impl SlotAllocator {
    pub fn new(store: Arc<dyn SlotStore>, config: Arc<AdmissionConfig>) -> Self {
        Self { store, config }
    }

    /// 1. Renew a live lease owned by `token`.
    /// 2. Otherwise walk indices `1..=capacity`, claiming the first absent, expired, or own row.
    ///    A lost race moves on to the next index; the same index is never retried.
    /// 3. If every index is taken, deny with the live count.
    pub async fn acquire(
        &self,
        resource_id: &ResourceId,
        token: &Token,
        user_id: Option<&UserId>,
        now: Ms,
    ) -> Result<AcquireResult, AdmissionError> {
        if !self.config.enabled {
            metrics::counter!(observability::ACQUIRE_TOTAL, "outcome" => "disabled").increment(1);
            return Ok(AcquireResult::Granted { lease: None });
        }
        let expires_at = now + self.config.ttl_ms();

        if let Some(lease) = self
            .store
            .renew_lease(resource_id, token, now, expires_at)
            .await?
        {
            debug!(resource = %resource_id, slot = lease.slot, "renewed on acquire");
            metrics::counter!(observability::ACQUIRE_TOTAL, "outcome" => "renewed").increment(1);
            return Ok(AcquireResult::Granted { lease: Some(lease) });
        }

        for slot in 1..=self.config.capacity {
            let claim = ClaimRequest {
                resource_id: resource_id.clone(),
                slot,
                token: *token,
                user_id: user_id.cloned(),
                now,
                expires_at,
            };
            match self.store.claim_slot(&claim).await? {
                ClaimOutcome::Claimed(lease) | ClaimOutcome::AlreadyHeld(lease) => {
                    debug!(resource = %resource_id, slot = lease.slot, "claimed slot");
                    metrics::counter!(observability::ACQUIRE_TOTAL, "outcome" => "claimed")
                        .increment(1);
                    return Ok(AcquireResult::Granted { lease: Some(lease) });
                }
                ClaimOutcome::Taken => {
                    metrics::counter!(observability::CLAIM_CONFLICTS_TOTAL).increment(1);
                }
            }
        }

        let usage = self.store.usage(resource_id, None, now).await?;
        debug!(resource = %resource_id, active = usage.active, "capacity reached");
        metrics::counter!(observability::ACQUIRE_TOTAL, "outcome" => "denied").increment(1);
        Ok(AcquireResult::Denied {
            reason: DenyReason::CapacityReached,
            active: usage.active,
            capacity: self.config.capacity,
        })
    }
}
