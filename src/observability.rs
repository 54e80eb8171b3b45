use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total HTTP requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "amenityd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "amenityd_request_duration_seconds";

/// Counter: bookings admitted as pending.
pub const BOOKINGS_CREATED_TOTAL: &str = "amenityd_bookings_created_total";

/// Counter: create requests rejected for overlapping an active booking.
pub const SCHEDULING_CONFLICTS_TOTAL: &str = "amenityd_scheduling_conflicts_total";

/// Counter: requests rejected for a missing or wrong bearer token.
pub const AUTH_FAILURES_TOTAL: &str = "amenityd_auth_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: number of facilities in the store.
pub const FACILITIES_ACTIVE: &str = "amenityd_facilities_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "amenityd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "amenityd_wal_flush_batch_size";

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
