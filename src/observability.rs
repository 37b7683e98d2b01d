use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "triplock_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "triplock_request_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "triplock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "triplock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "triplock_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "triplock_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "triplock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "triplock_wal_flush_batch_size";

// ── Claim arbitration ───────────────────────────────────────────

/// Counter: finished resolutions. Labels: outcome (won, lost, already_resolved, conflict, error).
pub const RESOLUTIONS_TOTAL: &str = "triplock_resolutions_total";

/// Histogram: transaction attempts a resolution needed.
pub const RESOLUTION_ATTEMPTS: &str = "triplock_resolution_attempts";

/// Counter: commits refused because a record moved since it was read.
pub const TXN_CONFLICTS_TOTAL: &str = "triplock_txn_conflicts_total";

/// Counter: sibling claims moved to superseded.
pub const CLAIMS_SUPERSEDED_TOTAL: &str = "triplock_claims_superseded_total";

/// Counter: sibling updates abandoned after retries.
pub const FANOUT_FAILURES_TOTAL: &str = "triplock_fanout_failures_total";

/// Counter: claims expired by timeout or trip cancellation.
pub const CLAIMS_EXPIRED_TOTAL: &str = "triplock_claims_expired_total";

/// Counter: undecided accept attempts re-emitted by the reaper.
pub const REDELIVERIES_TOTAL: &str = "triplock_redeliveries_total";

/// Counter: notifications sent. Labels: kind, delivered.
pub const NOTIFICATIONS_TOTAL: &str = "triplock_notifications_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a request to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Use { .. } => "use",
        Request::CreateTrip { .. } => "create_trip",
        Request::GetTrip { .. } => "get_trip",
        Request::UpdateTrip { .. } => "update_trip",
        Request::CreateClaim { .. } => "create_claim",
        Request::GetClaim { .. } => "get_claim",
        Request::ListClaims { .. } => "list_claims",
        Request::Accept { .. } => "accept",
        Request::Listen { .. } => "listen",
        Request::Unlisten { .. } => "unlisten",
        Request::UnlistenAll => "unlisten_all",
        Request::TestNotification { .. } => "test_notification",
    }
}
