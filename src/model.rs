use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::*;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// 1-based position within a resource's capacity. No ordering semantics.
pub type SlotIndex = u32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid resource id")]
    InvalidResourceId,
    #[error("missing token")]
    MissingToken,
    #[error("malformed token")]
    MalformedToken,
    #[error("invalid user id")]
    InvalidUserId,
}

/// Opaque identifier of a gated resource, supplied by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let text = raw.trim();
        let well_formed = !text.is_empty()
            && text.len() <= MAX_RESOURCE_ID_LEN
            && text
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !well_formed {
            return Err(ValidationError::InvalidResourceId);
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-bound viewing-session identifier. Issued once, carried in a cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(Ulid);

impl Token {
    pub fn issue() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(ValidationError::MissingToken);
        }
        Ulid::from_string(text)
            .map(Self)
            .map_err(|_| ValidationError::MalformedToken)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optional authenticated identity of the caller. Orthogonal to slot ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let text = raw.trim();
        let well_formed = !text.is_empty()
            && text.len() <= MAX_USER_ID_LEN
            && text.bytes().all(|b| b.is_ascii_graphic());
        if !well_formed {
            return Err(ValidationError::InvalidUserId);
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held slot as seen by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub slot: SlotIndex,
    pub expires_at: Ms,
}

/// One physical slot row. Presence alone says nothing about liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRow {
    pub slot: SlotIndex,
    pub token: Token,
    pub user_id: Option<UserId>,
    pub expires_at: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl SlotRow {
    pub fn is_live(&self, now: Ms) -> bool {
        self.expires_at > now
    }

    pub fn lease(&self) -> Lease {
        Lease {
            slot: self.slot,
            expires_at: self.expires_at,
        }
    }
}

/// Live occupancy of a resource, optionally from one token's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub active: u32,
    pub owned: Option<Lease>,
}

#[derive(Debug, Clone)]
pub struct ResourceSlots {
    pub id: ResourceId,
    /// Physical rows keyed by slot index, expired ones included until reaped.
    pub rows: BTreeMap<SlotIndex, SlotRow>,
}

impl ResourceSlots {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            rows: BTreeMap::new(),
        }
    }

    /// The live row owned by `token`, if any.
    pub fn live_row_of(&self, token: &Token, now: Ms) -> Option<&SlotRow> {
        self.rows
            .values()
            .find(|row| row.token == *token && row.is_live(now))
    }

    pub fn active_count(&self, now: Ms) -> u32 {
        self.rows.values().filter(|row| row.is_live(now)).count() as u32
    }

    /// A slot is claimable when absent, expired, or already owned by `token`.
    pub fn claimable(&self, slot: SlotIndex, token: &Token, now: Ms) -> bool {
        self.rows
            .get(&slot)
            .is_none_or(|row| !row.is_live(now) || row.token == *token)
    }

    pub fn expired_slots(&self, now: Ms) -> Vec<SlotIndex> {
        self.rows
            .values()
            .filter(|row| !row.is_live(now))
            .map(|row| row.slot)
            .collect()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotClaimed {
        resource_id: ResourceId,
        slot: SlotIndex,
        token: Token,
        user_id: Option<UserId>,
        expires_at: Ms,
        at: Ms,
    },
    LeaseRenewed {
        resource_id: ResourceId,
        slot: SlotIndex,
        expires_at: Ms,
        at: Ms,
    },
    SlotReclaimed {
        resource_id: ResourceId,
        slot: SlotIndex,
    },
    /// Snapshot of a row written by WAL compaction.
    SlotRestored {
        resource_id: ResourceId,
        row: SlotRow,
    },
}

impl Event {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Event::SlotClaimed { resource_id, .. }
            | Event::LeaseRenewed { resource_id, .. }
            | Event::SlotReclaimed { resource_id, .. }
            | Event::SlotRestored { resource_id, .. } => resource_id,
        }
    }
}
