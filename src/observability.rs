use std::net::SocketAddr;

use crate::engine::EngineError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetcal_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetcal_query_duration_seconds";

// ── Booking workflow ────────────────────────────────────────────

/// Counter: bookings stored as pending.
pub const BOOKINGS_SUBMITTED_TOTAL: &str = "fleetcal_bookings_submitted_total";

/// Counter: submissions refused before any write. Labels: reason.
pub const SUBMISSIONS_REFUSED_TOTAL: &str = "fleetcal_submissions_refused_total";

/// Counter: lifecycle transitions applied. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "fleetcal_booking_transitions_total";

/// Counter: confirmations refused because a confirmed booking holds the dates.
pub const STALE_CONFIRMATIONS_TOTAL: &str = "fleetcal_stale_confirmations_total";

/// Counter: submission notices nobody received.
pub const NOTIFY_FAILURES_TOTAL: &str = "fleetcal_notify_failures_total";

/// Counter: bookings completed by the background sweep.
pub const SWEEP_COMPLETED_TOTAL: &str = "fleetcal_sweep_completed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetcal_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetcal_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetcal_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "fleetcal_tenants_active";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "fleetcal_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetcal_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetcal_wal_flush_batch_size";

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
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::ReplaceSchedule { .. } => "replace_schedule",
        Command::UpsertOverride { .. } => "upsert_override",
        Command::ClearOverride { .. } => "clear_override",
        Command::SubmitBooking { .. } => "submit_booking",
        Command::Decide { .. } => "decide",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectVehicles => "select_vehicles",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectDayStatus { .. } => "select_day_status",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectCalendarSummary { .. } => "select_calendar_summary",
        Command::SelectBookable { .. } => "select_bookable",
        Command::SelectDisabledDates { .. } => "select_disabled_dates",
        Command::SelectActiveRentals { .. } => "select_active_rentals",
    }
}

/// Short label for an engine error, for the `reason` metric label.
pub fn error_label(err: &EngineError) -> &'static str {
    match err {
        EngineError::InvalidRange { .. } => "invalid_range",
        EngineError::PastDate { .. } => "past_date",
        EngineError::DateConflict { .. } => "date_conflict",
        EngineError::AuthenticationRequired => "authentication_required",
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "already_exists",
        EngineError::StaleConfirmation { .. } => "stale_confirmation",
        EngineError::InvalidTransition { .. } => "invalid_transition",
        EngineError::NotPermitted { .. } => "not_permitted",
        EngineError::ReturnNotDue { .. } => "return_not_due",
        EngineError::InvalidSchedule(_) => "invalid_schedule",
        EngineError::InvalidMonth { .. } => "invalid_month",
        EngineError::HasActiveBookings(_) => "has_active_bookings",
        EngineError::LimitExceeded(_) => "limit_exceeded",
        EngineError::WriteTimeout => "write_timeout",
        EngineError::WalError(_) => "wal_error",
    }
}
