use ulid::Ulid;

use crate::model::{BookingStatus, CalendarDate, Identity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// End precedes start (queries) or does not follow start (bookings).
    InvalidRange {
        start: CalendarDate,
        end: CalendarDate,
    },
    PastDate {
        start: CalendarDate,
        today: CalendarDate,
    },
    /// Some requested days are not available; sorted, deduplicated.
    DateConflict {
        blocking_dates: Vec<CalendarDate>,
    },
    AuthenticationRequired,
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Confirming would double-book days already held by a confirmed booking.
    StaleConfirmation {
        booking_id: Ulid,
        conflicting_id: Ulid,
        dates: Vec<CalendarDate>,
    },
    InvalidTransition {
        id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    NotPermitted {
        actor: Identity,
    },
    ReturnNotDue {
        id: Ulid,
        end_date: CalendarDate,
    },
    InvalidSchedule(&'static str),
    InvalidMonth {
        year: i32,
        month: u32,
    },
    HasActiveBookings(Ulid),
    LimitExceeded(&'static str),
    WriteTimeout,
    WalError(String),
}

fn join_dates(dates: &[CalendarDate]) -> String {
    dates
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid date range: {start} to {end}")
            }
            EngineError::PastDate { start, today } => {
                write!(f, "start date {start} is before today ({today})")
            }
            EngineError::DateConflict { blocking_dates } => {
                write!(f, "dates not available: {}", join_dates(blocking_dates))
            }
            EngineError::AuthenticationRequired => write!(f, "authentication required"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::StaleConfirmation {
                booking_id,
                conflicting_id,
                dates,
            } => write!(
                f,
                "cannot confirm {booking_id}: overlaps confirmed booking {conflicting_id} on {}",
                join_dates(dates)
            ),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id} cannot move from {from} to {to}")
            }
            EngineError::NotPermitted { actor } => write!(f, "not permitted for {actor}"),
            EngineError::ReturnNotDue { id, end_date } => {
                write!(f, "booking {id} runs until {end_date} and cannot complete yet")
            }
            EngineError::InvalidSchedule(msg) => write!(f, "invalid schedule: {msg}"),
            EngineError::InvalidMonth { year, month } => {
                write!(f, "invalid month: {year}-{month:02}")
            }
            EngineError::HasActiveBookings(id) => {
                write!(f, "cannot delete vehicle {id}: has active bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WriteTimeout => write!(f, "booking write timed out"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
