use crate::model::*;

use super::dates::{add_months, month_span};
use super::EngineError;

// ── Per-day precedence ───────────────────────────────────────────

/// Status of one day. Precedence, first match wins:
/// 1. any occupying booking covers the day → `Booked`
/// 2. an override exists → its flag
/// 3. the weekday is scheduled → `Available`
/// 4. otherwise `Unavailable`
pub fn status_of(vehicle: &Vehicle, bookings: &[Booking], day: CalendarDate) -> DayStatus {
    if bookings.iter().any(|b| b.occupies(day)) {
        return DayStatus::Booked;
    }
    schedule_status(vehicle, day)
}

/// Status from the host's calendar alone, ignoring bookings.
pub fn schedule_status(vehicle: &Vehicle, day: CalendarDate) -> DayStatus {
    let open = match vehicle.overrides.get(&day) {
        Some(available) => *available,
        None => vehicle.schedule.opens_on(day),
    };
    if open {
        DayStatus::Available
    } else {
        DayStatus::Unavailable
    }
}

/// Merge sorted overlapping or adjacent day ranges into disjoint ranges.
pub fn merge_spans(sorted: &[DateSpan]) -> Vec<DateSpan> {
    let mut merged: Vec<DateSpan> = Vec::with_capacity(sorted.len());
    for span in sorted {
        if let Some(last) = merged.last_mut()
            && last.end.succ_opt().is_some_and(|next| span.start <= next)
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(*span);
    }
    merged
}

/// Statuses over a fixed window, computed once from a booking snapshot.
///
/// Occupying bookings are clipped to the window and merged, so each lookup
/// is a binary search instead of a scan over every booking.
pub struct AvailabilityView<'a> {
    vehicle: &'a Vehicle,
    window: DateSpan,
    booked: Vec<DateSpan>,
}

impl<'a> AvailabilityView<'a> {
    pub fn new(vehicle: &'a Vehicle, bookings: &[Booking], window: DateSpan) -> Self {
        let mut spans: Vec<DateSpan> = bookings
            .iter()
            .filter(|b| b.status.occupies())
            .filter_map(|b| b.span().intersect(&window))
            .collect();
        spans.sort_by_key(|s| s.start);
        Self {
            vehicle,
            window,
            booked: merge_spans(&spans),
        }
    }

    pub fn window(&self) -> DateSpan {
        self.window
    }

    fn is_booked(&self, day: CalendarDate) -> bool {
        let idx = self.booked.partition_point(|s| s.end < day);
        self.booked.get(idx).is_some_and(|s| s.contains(day))
    }

    /// `None` for days outside the window.
    pub fn status_of(&self, day: CalendarDate) -> Option<DayStatus> {
        if !self.window.contains(day) {
            return None;
        }
        if self.is_booked(day) {
            return Some(DayStatus::Booked);
        }
        Some(schedule_status(self.vehicle, day))
    }

    pub fn iter(&self) -> impl Iterator<Item = (CalendarDate, DayStatus)> + '_ {
        self.window.days().map(|day| {
            let status = if self.is_booked(day) {
                DayStatus::Booked
            } else {
                schedule_status(self.vehicle, day)
            };
            (day, status)
        })
    }
}

/// Every day of one calendar month with its status, ascending.
pub fn project_month(
    vehicle: &Vehicle,
    bookings: &[Booking],
    year: i32,
    month: u32,
) -> Result<Vec<(CalendarDate, DayStatus)>, EngineError> {
    let window = month_span(year, month)?;
    Ok(AvailabilityView::new(vehicle, bookings, window).iter().collect())
}

// ── Listing-card summaries ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonthSummary {
    pub year: i32,
    pub month: u32,
    pub available: u32,
    pub unavailable: u32,
    pub booked: u32,
}

/// Day counts per status for `count` consecutive months from `(year, month)`.
pub fn summarize_months(
    vehicle: &Vehicle,
    bookings: &[Booking],
    year: i32,
    month: u32,
    count: u32,
) -> Result<Vec<MonthSummary>, EngineError> {
    if count > crate::limits::MAX_SUMMARY_MONTHS {
        return Err(EngineError::LimitExceeded("too many months requested"));
    }
    month_span(year, month)?;
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        let (y, m) = add_months(year, month, i);
        let mut summary = MonthSummary {
            year: y,
            month: m,
            ..MonthSummary::default()
        };
        for (_, status) in project_month(vehicle, bookings, y, m)? {
            match status {
                DayStatus::Available => summary.available += 1,
                DayStatus::Unavailable => summary.unavailable += 1,
                DayStatus::Booked => summary.booked += 1,
            }
        }
        out.push(summary);
    }
    Ok(out)
}
