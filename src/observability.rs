use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotkeeper_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotkeeper_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotkeeper_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotkeeper_wal_flush_batch_size";

// ── Booking domain ──────────────────────────────────────────────

/// Counter: holds granted.
pub const HOLDS_PLACED_TOTAL: &str = "slotkeeper_holds_placed_total";

/// Counter: holds that ran out their TTL and were reaped.
pub const HOLDS_LAPSED_TOTAL: &str = "slotkeeper_holds_lapsed_total";

/// Counter: bookings created. Labels: kind (confirmed, direct, manual).
pub const BOOKINGS_TOTAL: &str = "slotkeeper_bookings_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotkeeper_bookings_cancelled_total";

/// Counter: reservation attempts lost to a race. Labels: reason.
pub const RESERVATION_CONFLICTS_TOTAL: &str = "slotkeeper_reservation_conflicts_total";

/// Counter: slots inserted by generation runs.
pub const SLOTS_GENERATED_TOTAL: &str = "slotkeeper_slots_generated_total";

/// Counter: slots marked expired (past, or no longer produced by a pattern).
pub const SLOTS_EXPIRED_TOTAL: &str = "slotkeeper_slots_expired_total";

/// Counter: past slots dropped after the retention period.
pub const SLOTS_PURGED_TOTAL: &str = "slotkeeper_slots_purged_total";

/// Counter: patterns that failed to expand during generation.
pub const GENERATION_PATTERN_ERRORS_TOTAL: &str = "slotkeeper_generation_pattern_errors_total";

/// Counter: staleness events published. Labels: kind.
pub const STALENESS_EVENTS_TOTAL: &str = "slotkeeper_staleness_events_total";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProvider { .. } => "insert_provider",
        Command::UpsertPatterns { .. } => "upsert_patterns",
        Command::DeletePatterns { .. } => "delete_patterns",
        Command::InsertGenerationRun { .. } => "insert_generation_run",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectProviders { .. } => "select_providers",
        Command::SelectPatterns { .. } => "select_patterns",
        Command::SelectAvailableDates { .. } => "select_available_dates",
        Command::SelectAvailableTimes { .. } => "select_available_times",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectStaleness { .. } => "select_staleness",
        Command::SelectGenerationWarnings { .. } => "select_generation_warnings",
        Command::SelectSessionTypes => "select_session_types",
    }
}
