//! [`SlotStore`] backed by a slotgate store server.
//!
//! Every HTTP instance of a multi-instance deployment points at the same store server, which
//! serializes conflicting claims inside one engine. Calls use the simple-query protocol so
//! the server sees exactly one statement per store operation.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, SimpleQueryMessage, SimpleQueryRow};

use crate::model::*;
use crate::store::{ClaimOutcome, ClaimRequest, SlotStore, StoreError};

pub struct RemoteStore {
    url: String,
    client: RwLock<Arc<Client>>,
}

impl RemoteStore {
    /// Connect to the store server at `url` (libpq key/value or `postgres://` form).
    /// The database name selects the tenant.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = open(url).await?;
        Ok(Self {
            url: url.to_string(),
            client: RwLock::new(client),
        })
    }

    /// The live connection, reopened if the server dropped it.
    async fn client(&self) -> Result<Arc<Client>, StoreError> {
        {
            let current = self.client.read().await;
            if !current.is_closed() {
                return Ok(current.clone());
            }
        }
        let mut current = self.client.write().await;
        if current.is_closed() {
            tracing::warn!("store connection closed, reconnecting");
            *current = open(&self.url).await?;
        }
        Ok(current.clone())
    }

    async fn query(&self, sql: &str) -> Result<Vec<SimpleQueryRow>, StoreError> {
        let client = self.client().await?;
        let messages = client.simple_query(sql).await.map_err(pg_err)?;
        Ok(messages
            .into_iter()
            .filter_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect())
    }
}

async fn open(url: &str) -> Result<Arc<Client>, StoreError> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("store connection error: {e}");
        }
    });
    Ok(Arc::new(client))
}

fn pg_err(e: tokio_postgres::Error) -> StoreError {
    match e.as_db_error() {
        Some(db) => StoreError::Rejected(db.message().to_string()),
        None => StoreError::Unavailable(e.to_string()),
    }
}

/// Quote a text literal. Identifiers are validated before they get here, user ids may
/// still contain quotes.
fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn optional_literal(text: Option<&str>) -> String {
    text.map_or_else(|| "NULL".to_string(), literal)
}

fn column<T: FromStr>(row: &SimpleQueryRow, idx: usize) -> Result<T, StoreError> {
    optional_column(row, idx)?
        .ok_or_else(|| StoreError::Unavailable(format!("store returned NULL in column {idx}")))
}

fn optional_column<T: FromStr>(row: &SimpleQueryRow, idx: usize) -> Result<Option<T>, StoreError> {
    let raw = row
        .try_get(idx)
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    raw.map(|text| {
        text.parse()
            .map_err(|_| StoreError::Unavailable(format!("unexpected value {text:?} in column {idx}")))
    })
    .transpose()
}

fn lease_at(row: &SimpleQueryRow, slot_idx: usize) -> Result<Lease, StoreError> {
    Ok(Lease {
        slot: column(row, slot_idx)?,
        expires_at: column(row, slot_idx + 1)?,
    })
}

#[async_trait]
impl SlotStore for RemoteStore {
    async fn renew_lease(
        &self,
        resource_id: &ResourceId,
        token: &Token,
        now: Ms,
        expires_at: Ms,
    ) -> Result<Option<Lease>, StoreError> {
        let sql = format!(
            "SELECT * FROM renew_lease({}, {}, {now}, {expires_at})",
            literal(resource_id.as_str()),
            literal(&token.to_string()),
        );
        let rows = self.query(&sql).await?;
        rows.first().map(|row| lease_at(row, 0)).transpose()
    }

    async fn claim_slot(&self, claim: &ClaimRequest) -> Result<ClaimOutcome, StoreError> {
        let sql = format!(
            "SELECT * FROM claim_slot({}, {}, {}, {}, {}, {})",
            literal(claim.resource_id.as_str()),
            claim.slot,
            literal(&claim.token.to_string()),
            optional_literal(claim.user_id.as_ref().map(UserId::as_str)),
            claim.now,
            claim.expires_at,
        );
        let rows = self.query(&sql).await?;
        let Some(row) = rows.first() else {
            return Ok(ClaimOutcome::Taken);
        };
        let lease = lease_at(row, 1)?;
        match row.get(0) {
            Some("claimed") => Ok(ClaimOutcome::Claimed(lease)),
            Some("held") => Ok(ClaimOutcome::AlreadyHeld(lease)),
            other => Err(StoreError::Unavailable(format!(
                "unexpected claim outcome {other:?}"
            ))),
        }
    }

    async fn usage(
        &self,
        resource_id: &ResourceId,
        token: Option<&Token>,
        now: Ms,
    ) -> Result<Usage, StoreError> {
        let token = token.map(Token::to_string);
        let sql = format!(
            "SELECT * FROM slot_usage({}, {}, {now})",
            literal(resource_id.as_str()),
            optional_literal(token.as_deref()),
        );
        let rows = self.query(&sql).await?;
        let row = rows
            .first()
            .ok_or_else(|| StoreError::Unavailable("slot_usage returned no row".into()))?;

        let slot: Option<SlotIndex> = optional_column(row, 1)?;
        let expires_at: Option<Ms> = optional_column(row, 2)?;
        Ok(Usage {
            active: column(row, 0)?,
            owned: slot.zip(expires_at).map(|(slot, expires_at)| Lease { slot, expires_at }),
        })
    }
}
