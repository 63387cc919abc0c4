use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests executed. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "cadence_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "cadence_request_duration_seconds";

/// Counter: orchestrator dispatches. Labels: event.
pub const DISPATCHES_TOTAL: &str = "cadence_dispatches_total";

/// Counter: reservation holds placed.
pub const HOLDS_PLACED_TOTAL: &str = "cadence_holds_placed_total";

/// Counter: hold attempts rejected because the key was occupied.
pub const HOLD_CONFLICTS_TOTAL: &str = "cadence_hold_conflicts_total";

/// Counter: best-effort collaborator calls that failed (logged for
/// manual reconciliation).
pub const COLLAB_FAILURES_TOTAL: &str = "cadence_collab_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cadence_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cadence_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cadence_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "cadence_tenants_active";

/// Counter: failed hello handshakes.
pub const AUTH_FAILURES_TOTAL: &str = "cadence_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cadence_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "cadence_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
