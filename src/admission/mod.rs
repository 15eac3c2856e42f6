//! Admission control: who may hold one of a resource's slots right now.
//!
//! The three components share one [`SlotStore`] and one immutable [`AdmissionConfig`]. None of
//! them holds a lock; every guarantee comes from the store's conditional writes.

mod allocator;
mod heartbeat;
mod status;

pub use allocator::SlotAllocator;
pub use heartbeat::HeartbeatRenewer;
pub use status::StatusReporter;

use std::sync::Arc;

use serde::Serialize;

use crate::config::AdmissionConfig;
use crate::model::*;
use crate::store::{SlotStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    CapacityReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// `lease` is `None` only when admission is disabled.
    Granted { lease: Option<Lease> },
    Denied {
        reason: DenyReason,
        active: u32,
        capacity: u32,
    },
}

impl AcquireResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, AcquireResult::Granted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewResult {
    /// `expires_at` is `None` only when admission is disabled.
    Renewed { expires_at: Option<Ms> },
    NoSlot,
}

/// Advisory snapshot for a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub active: u32,
    pub capacity: u32,
    pub can_enter: bool,
}

impl StatusResult {
    /// What every caller sees while admission is switched off.
    pub fn open(capacity: u32) -> Self {
        Self {
            active: 0,
            capacity,
            can_enter: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The admission components wired to one store.
pub struct Admission {
    pub allocator: SlotAllocator,
    pub heartbeat: HeartbeatRenewer,
    pub status: StatusReporter,
    config: Arc<AdmissionConfig>,
}

impl Admission {
    pub fn new(store: Arc<dyn SlotStore>, config: AdmissionConfig) -> Self {
        let config = Arc::new(config);
        Self {
            allocator: SlotAllocator::new(store.clone(), config.clone()),
            heartbeat: HeartbeatRenewer::new(store.clone(), config.clone()),
            status: StatusReporter::new(store, config.clone()),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }
}
