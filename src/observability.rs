use std::net::SocketAddr;

use crate::sql::Command;

// ── Admission (HTTP-driven) ─────────────────────────────────────

/// Counter: acquire decisions. Labels: outcome (renewed, claimed, denied, disabled).
pub const ACQUIRE_TOTAL: &str = "slotgate_acquire_total";

/// Counter: claim attempts lost to another token on the same index.
pub const CLAIM_CONFLICTS_TOTAL: &str = "slotgate_claim_conflicts_total";

/// Counter: heartbeat renewals. Labels: outcome (renewed, no_slot, disabled).
pub const RENEWALS_TOTAL: &str = "slotgate_renewals_total";

/// Counter: status queries served.
pub const STATUS_QUERIES_TOTAL: &str = "slotgate_status_queries_total";

/// Counter: requests refused by the per-caller throttle. Labels: route.
pub const RATE_LIMITED_TOTAL: &str = "slotgate_rate_limited_total";

/// Counter: store calls that failed and closed the gate.
pub const STORE_ERRORS_TOTAL: &str = "slotgate_store_errors_total";

// ── Store server ────────────────────────────────────────────────

/// Counter: store queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotgate_store_queries_total";

/// Histogram: store query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotgate_store_query_duration_seconds";

/// Gauge: open store-server connections.
pub const CONNECTIONS_ACTIVE: &str = "slotgate_store_connections_active";

/// Counter: store-server connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotgate_store_connections_total";

/// Counter: store-server connections refused at the connection cap.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotgate_store_connections_rejected_total";

/// Gauge: loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotgate_tenants_active";

// ── Engine ──────────────────────────────────────────────────────

/// Counter: expired slot rows physically removed.
pub const SLOTS_REAPED_TOTAL: &str = "slotgate_slots_reaped_total";

/// Counter: WAL compactions completed.
pub const COMPACTIONS_TOTAL: &str = "slotgate_wal_compactions_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotgate_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotgate_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op when `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a store command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::RenewLease { .. } => "renew_lease",
        Command::ClaimSlot(_) => "claim_slot",
        Command::SlotUsage { .. } => "slot_usage",
        Command::SelectSlots { .. } => "select_slots",
        Command::DeleteExpired { .. } => "delete_expired",
    }
}
