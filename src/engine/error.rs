use crate::model::{Ms, SlotIndex};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("slot index {0} out of range")]
    InvalidSlot(SlotIndex),
    #[error("lease would expire at {expires_at}, not after {now}")]
    InvalidExpiry { now: Ms, expires_at: Ms },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
