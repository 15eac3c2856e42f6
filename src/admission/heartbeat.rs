use std::sync::Arc;

use crate::config::AdmissionConfig;
use crate::model::*;
use crate::observability;
use crate::store::SlotStore;

use super::{AdmissionError, RenewResult};

/// Extends a lease the caller already holds. Never creates one: a caller that let its lease
/// lapse has to go back through [`SlotAllocator`](super::SlotAllocator).
pub struct HeartbeatRenewer {
    store: Arc<dyn SlotStore>,
    config: Arc<AdmissionConfig>,
}

impl HeartbeatRenewer {
    pub fn new(store: Arc<dyn SlotStore>, config: Arc<AdmissionConfig>) -> Self {
        Self { store, config }
    }

    pub async fn renew(
        &self,
        resource_id: &ResourceId,
        token: &Token,
        now: Ms,
    ) -> Result<RenewResult, AdmissionError> {
        if !self.config.enabled {
            metrics::counter!(observability::RENEWALS_TOTAL, "outcome" => "disabled").increment(1);
            return Ok(RenewResult::Renewed { expires_at: None });
        }

        let renewed = self
            .store
            .renew_lease(resource_id, token, now, now + self.config.ttl_ms())
            .await?;
        Ok(match renewed {
            Some(lease) => {
                metrics::counter!(observability::RENEWALS_TOTAL, "outcome" => "renewed")
                    .increment(1);
                RenewResult::Renewed {
                    expires_at: Some(lease.expires_at),
                }
            }
            None => {
                tracing::debug!(resource = %resource_id, "heartbeat without a live slot");
                metrics::counter!(observability::RENEWALS_TOTAL, "outcome" => "no_slot")
                    .increment(1);
                RenewResult::NoSlot
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::testing::*;
    use crate::store::ClaimRequest;

    fn renewer(engine: Arc<crate::engine::Engine>, enabled: bool) -> HeartbeatRenewer {
        let config = AdmissionConfig::new(enabled, 2, 3, 1).unwrap();
        HeartbeatRenewer::new(engine, Arc::new(config))
    }

    async fn hold(engine: &crate::engine::Engine, resource: &ResourceId, token: Token) {
        engine
            .claim_slot(&ClaimRequest {
                resource_id: resource.clone(),
                slot: 1,
                token,
                user_id: None,
                now: T0,
                expires_at: T0 + 3 * S,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn renewal_extends_from_now() {
        let engine = test_engine("heartbeat_extends");
        let r = ResourceId::parse("room").unwrap();
        let a = Token::issue();
        hold(&engine, &r, a).await;

        let result = renewer(engine, true).renew(&r, &a, T0 + 2 * S).await.unwrap();
        assert_eq!(
            result,
            RenewResult::Renewed {
                expires_at: Some(T0 + 5 * S)
            }
        );
    }

    #[tokio::test]
    async fn renewal_never_creates_a_lease() {
        let engine = test_engine("heartbeat_never_creates");
        let r = ResourceId::parse("room").unwrap();
        let stranger = Token::issue();

        let result = renewer(engine.clone(), true).renew(&r, &stranger, T0).await.unwrap();
        assert_eq!(result, RenewResult::NoSlot);
        assert_eq!(engine.usage(&r, None, T0).await.active, 0);
    }

    #[tokio::test]
    async fn lapsed_lease_is_lost() {
        let engine = test_engine("heartbeat_lapsed");
        let r = ResourceId::parse("room").unwrap();
        let a = Token::issue();
        hold(&engine, &r, a).await;

        let result = renewer(engine, true).renew(&r, &a, T0 + 3 * S).await.unwrap();
        assert_eq!(result, RenewResult::NoSlot);
    }

    #[tokio::test]
    async fn disabled_renewal_reports_no_expiry() {
        let engine = test_engine("heartbeat_disabled");
        let r = ResourceId::parse("room").unwrap();
        let result = renewer(engine, false).renew(&r, &Token::issue(), T0).await.unwrap();
        assert_eq!(result, RenewResult::Renewed { expires_at: None });
    }
}
