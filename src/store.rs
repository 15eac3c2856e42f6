//! The slot-store seam.
//!
//! Every admission decision goes through a [`SlotStore`]. Implementations must make
//! [`SlotStore::claim_slot`] and [`SlotStore::renew_lease`] atomic with respect to every other
//! caller that can reach the same rows, including callers in other processes. Nothing above
//! this trait holds a lock.

use async_trait::async_trait;

use crate::model::*;

/// One conditional write against a single slot index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRequest {
    pub resource_id: ResourceId,
    pub slot: SlotIndex,
    pub token: Token,
    pub user_id: Option<UserId>,
    pub now: Ms,
    pub expires_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The requested index was absent, expired, or already ours; it is now held until `expires_at`.
    Claimed(Lease),
    /// The token already held a live row at another index; that row was extended instead.
    AlreadyHeld(Lease),
    /// Another token holds a live row at this index.
    Taken,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("slot store unavailable: {0}")]
    Unavailable(String),
    #[error("slot store rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Extend the live lease `token` holds on `resource_id`. Never creates ownership.
    async fn renew_lease(
        &self,
        resource_id: &ResourceId,
        token: &Token,
        now: Ms,
        expires_at: Ms,
    ) -> Result<Option<Lease>, StoreError>;

    async fn claim_slot(&self, claim: &ClaimRequest) -> Result<ClaimOutcome, StoreError>;

    /// Read-only occupancy snapshot.
    async fn usage(
        &self,
        resource_id: &ResourceId,
        token: Option<&Token>,
        now: Ms,
    ) -> Result<Usage, StoreError>;
}
