use std::collections::BTreeSet;

use ulid::Ulid;

use crate::limits::{MAX_BOOKING_DAYS, MAX_HORIZON_DAYS};
use crate::model::*;

use super::availability::AvailabilityView;
use super::dates::add_days;
use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookability {
    pub ok: bool,
    /// Days in the request that are booked or unavailable, ascending.
    pub blocking_dates: Vec<CalendarDate>,
}

impl Bookability {
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.ok {
            Ok(())
        } else {
            Err(EngineError::DateConflict {
                blocking_dates: self.blocking_dates,
            })
        }
    }
}

pub(crate) fn validate_request(
    start: CalendarDate,
    end: CalendarDate,
    as_of: CalendarDate,
) -> Result<DateSpan, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidRange { start, end });
    }
    if start < as_of {
        return Err(EngineError::PastDate {
            start,
            today: as_of,
        });
    }
    let span = DateSpan::try_new(start, end)?;
    if span.len_days() > MAX_BOOKING_DAYS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

/// Whether `[start, end]` can be requested as of `as_of`.
///
/// A booking spans at least one night, so `end` must be strictly after
/// `start`. Pending bookings block just like confirmed ones.
pub fn is_bookable(
    vehicle: &Vehicle,
    bookings: &[Booking],
    start: CalendarDate,
    end: CalendarDate,
    as_of: CalendarDate,
) -> Result<Bookability, EngineError> {
    let span = validate_request(start, end, as_of)?;
    let view = AvailabilityView::new(vehicle, bookings, span);
    let blocking_dates: Vec<CalendarDate> = view
        .iter()
        .filter(|(_, status)| *status != DayStatus::Available)
        .map(|(day, _)| day)
        .collect();
    Ok(Bookability {
        ok: blocking_dates.is_empty(),
        blocking_dates,
    })
}

/// Dates a picker must grey out: everything before `before`, plus every
/// non-available day in `[before, before + horizon]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisabledDates {
    pub before: CalendarDate,
    pub dates: BTreeSet<CalendarDate>,
}

impl DisabledDates {
    pub fn contains(&self, day: CalendarDate) -> bool {
        day < self.before || self.dates.contains(&day)
    }
}

pub fn disabled_dates(
    vehicle: &Vehicle,
    bookings: &[Booking],
    today: CalendarDate,
    horizon_days: u32,
) -> Result<DisabledDates, EngineError> {
    if horizon_days > MAX_HORIZON_DAYS {
        return Err(EngineError::LimitExceeded("horizon too far"));
    }
    let window = DateSpan::try_new(today, add_days(today, horizon_days)?)?;
    let view = AvailabilityView::new(vehicle, bookings, window);
    let dates = view
        .iter()
        .filter(|(_, status)| *status != DayStatus::Available)
        .map(|(day, _)| day)
        .collect();
    Ok(DisabledDates {
        before: today,
        dates,
    })
}

/// A confirmed booking sharing days with a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clash {
    pub booking_id: Ulid,
    pub dates: Vec<CalendarDate>,
}

/// Confirm-time re-check: other bookings already holding the vehicle
/// (confirmed or completed) whose days overlap `candidate`. The candidate
/// itself and still-pending requests are ignored.
pub fn confirmed_clashes(candidate: &Booking, bookings: &[Booking]) -> Vec<Clash> {
    let span = candidate.span();
    bookings
        .iter()
        .filter(|b| b.id != candidate.id)
        .filter(|b| matches!(b.status, BookingStatus::Confirmed | BookingStatus::Completed))
        .filter_map(|b| {
            b.span().intersect(&span).map(|shared| Clash {
                booking_id: b.id,
                dates: shared.days().collect(),
            })
        })
        .collect()
}
