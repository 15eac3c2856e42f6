use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;
use crate::store::{ClaimOutcome, ClaimRequest};

use super::{Engine, EngineError, WalCommand};

fn validate_expiry(now: Ms, expires_at: Ms) -> Result<(), EngineError> {
    if expires_at <= now {
        return Err(EngineError::InvalidExpiry { now, expires_at });
    }
    Ok(())
}

impl Engine {
    /// Extend the live row owned by `token`. Returns `None` when the token holds nothing live,
    /// which includes a row that is physically present but already expired.
    pub async fn renew_lease(
        &self,
        resource_id: &ResourceId,
        token: &Token,
        now: Ms,
        expires_at: Ms,
    ) -> Result<Option<Lease>, EngineError> {
        validate_expiry(now, expires_at)?;
        let _gate = self.compaction_gate.read().await;
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(None);
        };
        let mut guard = rs.write().await;
        let Some(slot) = guard.live_row_of(token, now).map(|row| row.slot) else {
            return Ok(None);
        };

        let event = Event::LeaseRenewed {
            resource_id: resource_id.clone(),
            slot,
            expires_at,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(Some(Lease { slot, expires_at }))
    }

    /// Conditionally take `claim.slot`: succeeds if the row is absent, expired, or already
    /// owned by the claiming token. A token never ends up with two live rows on one resource;
    /// if it already holds another index, that row is extended and reported instead.
    pub async fn claim_slot(&self, claim: &ClaimRequest) -> Result<ClaimOutcome, EngineError> {
        if claim.slot == 0 || claim.slot > MAX_CAPACITY {
            return Err(EngineError::InvalidSlot(claim.slot));
        }
        validate_expiry(claim.now, claim.expires_at)?;

        let _gate = self.compaction_gate.read().await;
        let rs = self.get_or_create_resource(&claim.resource_id)?;
        let mut guard = rs.write().await;

        let held = guard
            .live_row_of(&claim.token, claim.now)
            .map(|row| row.slot);
        if let Some(slot) = held
            && slot != claim.slot
        {
            let event = Event::LeaseRenewed {
                resource_id: claim.resource_id.clone(),
                slot,
                expires_at: claim.expires_at,
                at: claim.now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            return Ok(ClaimOutcome::AlreadyHeld(Lease {
                slot,
                expires_at: claim.expires_at,
            }));
        }

        if !guard.claimable(claim.slot, &claim.token, claim.now) {
            return Ok(ClaimOutcome::Taken);
        }

        let event = Event::SlotClaimed {
            resource_id: claim.resource_id.clone(),
            slot: claim.slot,
            token: claim.token,
            user_id: claim.user_id.clone(),
            expires_at: claim.expires_at,
            at: claim.now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(ClaimOutcome::Claimed(Lease {
            slot: claim.slot,
            expires_at: claim.expires_at,
        }))
    }

    /// Physically remove one row, but only if it is still expired under the write lock.
    /// A row renewed or re-claimed since it was collected survives.
    pub async fn reclaim_expired(
        &self,
        resource_id: &ResourceId,
        slot: SlotIndex,
        now: Ms,
    ) -> Result<bool, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let Some(rs) = self.get_resource(resource_id) else {
            return Ok(false);
        };
        let mut guard = rs.write().await;
        let still_expired = guard.rows.get(&slot).is_some_and(|row| !row.is_live(now));
        if !still_expired {
            return Ok(false);
        }
        let event = Event::SlotReclaimed {
            resource_id: resource_id.clone(),
            slot,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Reclaim every row expired at `now`. Returns the number removed.
    pub async fn sweep_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let mut removed = 0;
        for (resource_id, slot) in self.collect_expired_slots(now) {
            if self.reclaim_expired(&resource_id, slot, now).await? {
                tracing::debug!(resource = %resource_id, slot, "reclaimed expired slot");
                removed += 1;
            }
        }
        if removed > 0 {
            // Exclusive gate: no mutation can be holding a handle to an entry we drop.
            let _gate = self.compaction_gate.write().await;
            self.state
                .retain(|_, rs| rs.try_read().map_or(true, |guard| !guard.rows.is_empty()));
        }
        Ok(removed)
    }

    pub async fn appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Rewrite the WAL as one `SlotRestored` per physical row.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;

        let handles: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for rs in handles {
            let guard = rs.read().await;
            for row in guard.rows.values() {
                events.push(Event::SlotRestored {
                    resource_id: guard.id.clone(),
                    row: row.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
