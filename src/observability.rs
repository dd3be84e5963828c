use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "makerlab_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "makerlab_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "makerlab_connections_active";

pub const CONNECTIONS_TOTAL: &str = "makerlab_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "makerlab_connections_rejected_total";

/// Gauge: sites with a loaded engine.
pub const SITES_ACTIVE: &str = "makerlab_sites_active";

/// Counter: sessions whose login did not resolve to a principal.
pub const AUTH_FAILURES_TOTAL: &str = "makerlab_auth_failures_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "makerlab_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "makerlab_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

pub const BOOKINGS_CREATED_TOTAL: &str = "makerlab_bookings_created_total";

/// Counter: committed status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "makerlab_booking_transitions_total";

/// Counter: requests or approvals refused because the slot was taken.
pub const SLOT_CONFLICTS_TOTAL: &str = "makerlab_slot_conflicts_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
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
        Command::InsertUser { .. } => "insert_user",
        Command::UpdateUser { .. } => "update_user",
        Command::SelectUsers { .. } => "select_users",
        Command::InsertCertification { .. } => "insert_certification",
        Command::DeleteCertification { .. } => "delete_certification",
        Command::SelectCertifications { .. } => "select_certifications",
        Command::InsertMachine { .. } => "insert_machine",
        Command::UpdateMachine { .. } => "update_machine",
        Command::DeleteMachine { .. } => "delete_machine",
        Command::SelectMachines { .. } => "select_machines",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSlots { .. } => "select_slots",
    }
}
