use std::net::{IpAddr, SocketAddr};

use metrics_exporter_prometheus::BuildError;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "spotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "spotbook_query_duration_seconds";

/// Counter: mutations refused by the booking rules. Labels: reason
/// (`conflict`, `forbidden`, `invalid_dates`).
pub const REJECTIONS_TOTAL: &str = "spotbook_rejections_total";

/// Counter: failed `session` logins.
pub const LOGIN_FAILURES_TOTAL: &str = "spotbook_login_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "spotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "spotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "spotbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotbook_wal_flush_batch_size";

/// Counter: background WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "spotbook_compactions_total";

/// Install the Prometheus exporter on `bind:port`. No-op if port is None.
pub fn init(bind: IpAddr, port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr = SocketAddr::new(bind, port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// The rejection reason label for errors the booking rules produce.
pub fn rejection_reason(err: &EngineError) -> Option<&'static str> {
    match err {
        EngineError::BookingConflict(_) => Some("conflict"),
        EngineError::Forbidden(_) => Some("forbidden"),
        EngineError::InvalidDateRange(_) => Some("invalid_dates"),
        _ => None,
    }
}

pub fn record_rejection(err: &EngineError) {
    if let Some(reason) = rejection_reason(err) {
        metrics::counter!(REJECTIONS_TOTAL, "reason" => reason).increment(1);
    }
}
