//! Calendar-day arithmetic. Everything downstream works on whole days in the
//! vehicle's local calendar.

use chrono::{DateTime, Datelike, Days, FixedOffset, Months, NaiveDate, Utc};

use crate::model::{CalendarDate, DateSpan};

use super::EngineError;

/// Local calendar day of `instant` at the pickup location.
pub fn normalize(instant: DateTime<Utc>, offset: FixedOffset) -> CalendarDate {
    instant.with_timezone(&offset).date_naive()
}

/// Ascending days of an inclusive range. Cheap to clone and restart.
#[derive(Debug, Clone)]
pub struct DaysInRange {
    next: Option<CalendarDate>,
    end: CalendarDate,
}

impl Iterator for DaysInRange {
    type Item = CalendarDate;

    fn next(&mut self) -> Option<CalendarDate> {
        let current = self.next?;
        self.next = if current < self.end {
            current.succ_opt()
        } else {
            None
        };
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = match self.next {
            Some(d) => (self.end.signed_duration_since(d).num_days() + 1).max(0) as usize,
            None => 0,
        };
        (n, Some(n))
    }
}

impl ExactSizeIterator for DaysInRange {}

/// Every day in `[start, end]`. `start == end` yields one day.
pub fn days_in_range(
    start: CalendarDate,
    end: CalendarDate,
) -> Result<DaysInRange, EngineError> {
    if end < start {
        return Err(EngineError::InvalidRange { start, end });
    }
    Ok(DaysInRange {
        next: Some(start),
        end,
    })
}

impl DateSpan {
    pub fn days(&self) -> DaysInRange {
        DaysInRange {
            next: Some(self.start),
            end: self.end,
        }
    }
}

/// Inclusive overlap; ranges sharing a single boundary day overlap.
pub fn ranges_overlap(
    a_start: CalendarDate,
    a_end: CalendarDate,
    b_start: CalendarDate,
    b_end: CalendarDate,
) -> bool {
    a_start <= b_end && b_start <= a_end
}

/// First through last day of a calendar month.
pub fn month_span(year: i32, month: u32) -> Result<DateSpan, EngineError> {
    let invalid = EngineError::InvalidMonth { year, month };
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or(invalid.clone())?;
    let last = first
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .ok_or(invalid)?;
    DateSpan::try_new(first, last)
}

/// `(year, month)` shifted forward by `n` months.
pub fn add_months(year: i32, month: u32, n: u32) -> (i32, u32) {
    let zero_based = year as i64 * 12 + (month as i64 - 1) + n as i64;
    ((zero_based.div_euclid(12)) as i32, (zero_based.rem_euclid(12) + 1) as u32)
}

pub fn add_days(day: CalendarDate, n: u32) -> Result<CalendarDate, EngineError> {
    day.checked_add_days(Days::new(n as u64))
        .ok_or(EngineError::LimitExceeded("date out of range"))
}

pub fn month_of(day: CalendarDate) -> (i32, u32) {
    (day.year(), day.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> CalendarDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn overlap_is_symmetric_and_inclusive() {
        let cases = [
            ((d(2024, 6, 1), d(2024, 6, 5)), (d(2024, 6, 5), d(2024, 6, 8)), true),
            ((d(2024, 6, 1), d(2024, 6, 5)), (d(2024, 6, 6), d(2024, 6, 8)), false),
            ((d(2024, 6, 1), d(2024, 6, 30)), (d(2024, 6, 10), d(2024, 6, 12)), true),
            ((d(2024, 6, 3), d(2024, 6, 3)), (d(2024, 6, 3), d(2024, 6, 3)), true),
        ];
        for ((a0, a1), (b0, b1), expected) in cases {
            assert_eq!(ranges_overlap(a0, a1, b0, b1), expected);
            assert_eq!(ranges_overlap(b0, b1, a0, a1), expected);
        }
    }

    #[test]
    fn days_in_range_counts_both_ends() {
        let days: Vec<_> = days_in_range(d(2024, 2, 27), d(2024, 3, 1)).unwrap().collect();
        assert_eq!(
            days,
            vec![d(2024, 2, 27), d(2024, 2, 28), d(2024, 2, 29), d(2024, 3, 1)]
        );
        assert_eq!(days_in_range(d(2024, 6, 1), d(2024, 6, 1)).unwrap().len(), 1);
    }

    #[test]
    fn days_in_range_rejects_reversed() {
        assert_eq!(
            days_in_range(d(2024, 6, 2), d(2024, 6, 1)).unwrap_err(),
            EngineError::InvalidRange {
                start: d(2024, 6, 2),
                end: d(2024, 6, 1)
            }
        );
    }

    #[test]
    fn iterator_restarts_from_clone() {
        let it = days_in_range(d(2024, 6, 1), d(2024, 6, 3)).unwrap();
        assert_eq!(it.clone().count(), 3);
        assert_eq!(it.count(), 3);
    }

    #[test]
    fn month_span_handles_leap_years() {
        assert_eq!(month_span(2024, 2).unwrap().end, d(2024, 2, 29));
        assert_eq!(month_span(2023, 2).unwrap().end, d(2023, 2, 28));
        assert_eq!(month_span(2024, 12).unwrap().end, d(2024, 12, 31));
        assert!(month_span(2024, 13).is_err());
        assert!(month_span(2024, 0).is_err());
    }

    #[test]
    fn add_months_wraps_year() {
        assert_eq!(add_months(2024, 11, 0), (2024, 11));
        assert_eq!(add_months(2024, 11, 2), (2025, 1));
        assert_eq!(add_months(2024, 1, 24), (2026, 1));
    }

    #[test]
    fn normalize_crosses_midnight_with_offset() {
        let instant = Utc.with_ymd_and_hms(2024, 6, 30, 22, 30, 0).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        let plus_three = FixedOffset::east_opt(3 * 3600).unwrap();
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        assert_eq!(normalize(instant, utc), d(2024, 6, 30));
        assert_eq!(normalize(instant, plus_three), d(2024, 7, 1));
        assert_eq!(normalize(instant, minus_five), d(2024, 6, 30));
    }
}
