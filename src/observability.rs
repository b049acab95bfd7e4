use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use crate::engine::EngineError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: operation, status.
pub const OPERATIONS_TOTAL: &str = "bunkbook_operations_total";

/// Histogram: operation latency in seconds. Labels: operation.
pub const OPERATION_DURATION_SECONDS: &str = "bunkbook_operation_duration_seconds";

/// Counter: allocations rejected as unavailable. Labels: strategy.
pub const ALLOCATION_CONFLICTS_TOTAL: &str = "bunkbook_allocation_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: CONFIRMED reservations currently held.
pub const RESERVATIONS_ACTIVE: &str = "bunkbook_reservations_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bunkbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bunkbook_wal_flush_batch_size";

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

/// Run one engine operation, counting it by outcome and timing it.
pub(crate) async fn timed<T>(
    operation: &'static str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let start = Instant::now();
    let result = fut.await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "operation" => operation)
        .record(start.elapsed().as_secs_f64());
    result
}
