mod error;
mod mutations;
mod queries;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::limits::*;
use crate::model::*;
use crate::store::{ClaimOutcome, ClaimRequest, SlotStore, StoreError};
use crate::wal::Wal;

pub type SharedResourceSlots = Arc<RwLock<ResourceSlots>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain every Append already queued behind it.
/// 4. One flush_sync for the whole batch.
/// 5. Answer every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before touching the file for anything else
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so half-buffered bytes don't
    // ride along with the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply an event to a resource's rows (caller holds the lock).
fn apply_event(rs: &mut ResourceSlots, event: &Event) {
    match event {
        Event::SlotClaimed {
            slot,
            token,
            user_id,
            expires_at,
            at,
            ..
        } => {
            let created_at = rs
                .rows
                .get(slot)
                .filter(|row| row.token == *token)
                .map_or(*at, |row| row.created_at);
            rs.rows.insert(
                *slot,
                SlotRow {
                    slot: *slot,
                    token: *token,
                    user_id: user_id.clone(),
                    expires_at: *expires_at,
                    created_at,
                    updated_at: *at,
                },
            );
        }
        Event::LeaseRenewed {
            slot,
            expires_at,
            at,
            ..
        } => {
            if let Some(row) = rs.rows.get_mut(slot) {
                row.expires_at = *expires_at;
                row.updated_at = *at;
            }
        }
        Event::SlotReclaimed { slot, .. } => {
            rs.rows.remove(slot);
        }
        Event::SlotRestored { row, .. } => {
            rs.rows.insert(row.slot, row.clone());
        }
    }
}

/// Durable slot store for one tenant.
///
/// Each resource's rows sit behind their own async `RwLock`; a mutation holds the write lock
/// across check, WAL commit, and apply, which is what makes a claim atomic. The store is
/// authoritative only for callers that reach it: either in-process, or through the store
/// server (`wire`) for multi-instance deployments.
pub struct Engine {
    pub state: DashMap<ResourceId, SharedResourceSlots>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction holds it exclusively so no append
    /// can land between the snapshot and the log swap.
    pub(super) compaction_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the group-commit writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut rebuilt: HashMap<ResourceId, ResourceSlots> = HashMap::new();
        for event in &events {
            let rs = rebuilt
                .entry(event.resource_id().clone())
                .or_insert_with(|| ResourceSlots::new(event.resource_id().clone()));
            apply_event(rs, event);
        }

        let state = DashMap::new();
        for (id, rs) in rebuilt {
            if !rs.rows.is_empty() {
                state.insert(id, Arc::new(RwLock::new(rs)));
            }
        }
        tracing::debug!(events = events.len(), resources = state.len(), "replayed slot WAL");

        Ok(Self {
            state,
            wal_tx,
            compaction_gate: RwLock::new(()),
        })
    }

    /// Send an event to the background group-commit writer and wait for fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &ResourceId) -> Option<SharedResourceSlots> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Resources come into existence on their first claim.
    pub(super) fn get_or_create_resource(
        &self,
        id: &ResourceId,
    ) -> Result<SharedResourceSlots, EngineError> {
        if let Some(rs) = self.get_resource(id) {
            return Ok(rs);
        }
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let entry = self
            .state
            .entry(id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceSlots::new(id.clone()))));
        Ok(entry.value().clone())
    }

    /// Durably log the event, then apply it. Caller holds the resource write lock.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut ResourceSlots,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(rs, event);
        Ok(())
    }
}

impl From<EngineError> for StoreError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::WalError(msg) => StoreError::Unavailable(msg),
            other => StoreError::Rejected(other.to_string()),
        }
    }
}

#[async_trait]
impl SlotStore for Engine {
    async fn renew_lease(
        &self,
        resource_id: &ResourceId,
        token: &Token,
        now: Ms,
        expires_at: Ms,
    ) -> Result<Option<Lease>, StoreError> {
        Ok(Engine::renew_lease(self, resource_id, token, now, expires_at).await?)
    }

    async fn claim_slot(&self, claim: &ClaimRequest) -> Result<ClaimOutcome, StoreError> {
        Ok(Engine::claim_slot(self, claim).await?)
    }

    async fn usage(
        &self,
        resource_id: &ResourceId,
        token: Option<&Token>,
        now: Ms,
    ) -> Result<Usage, StoreError> {
        Ok(Engine::usage(self, resource_id, token, now).await)
    }
}
