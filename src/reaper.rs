use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::limits::REAP_GRACE_MS;
use crate::observability;

/// Periodically remove expired slot rows. Expired rows are already invisible to every
/// admission decision; sweeping only bounds memory and WAL growth.
pub async fn run_reaper(engine: Arc<Engine>, clock: Arc<dyn Clock>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reap_due(&engine, clock.as_ref()).await;
    }
}

/// Sweep rows that expired at least [`REAP_GRACE_MS`] before `clock`'s now.
pub async fn reap_due(engine: &Engine, clock: &dyn Clock) -> usize {
    reap_once(engine, clock.now_ms() - REAP_GRACE_MS).await
}

/// One sweep at `now`. Returns how many rows were removed.
pub async fn reap_once(engine: &Engine, now: i64) -> usize {
    match engine.sweep_expired(now).await {
        Ok(0) => 0,
        Ok(removed) => {
            debug!(removed, "reaped expired slots");
            metrics::counter!(observability::SLOTS_REAPED_TOTAL).increment(removed as u64);
            removed
        }
        Err(e) => {
            error!("reaper sweep failed: {e}");
            0
        }
    }
}

/// Compact the WAL once `threshold` appends have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = match engine.appends_since_compact().await {
        Ok(n) => n,
        Err(e) => {
            error!("compactor could not read WAL state: {e}");
            return false;
        }
    };
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            metrics::counter!(observability::COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
