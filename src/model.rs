use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// A day in the vehicle's local calendar. Conflict logic never sees time-of-day.
pub type CalendarDate = NaiveDate;

/// Inclusive day range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: CalendarDate,
    pub end: CalendarDate,
}

impl DateSpan {
    pub fn new(start: CalendarDate, end: CalendarDate) -> Self {
        debug_assert!(start <= end, "DateSpan start must not be after end");
        Self { start, end }
    }

    /// Checked constructor for bounds that did not come from a literal.
    pub fn try_new(start: CalendarDate, end: CalendarDate) -> Result<Self, EngineError> {
        if start > end {
            return Err(EngineError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(day: CalendarDate) -> Self {
        Self { start: day, end: day }
    }

    /// Number of days covered, both ends included.
    pub fn len_days(&self) -> i64 {
        self.end.signed_duration_since(self.start).num_days() + 1
    }

    pub fn contains(&self, day: CalendarDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Touching ranges overlap: one calendar day can't serve two renters.
    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersect(&self, other: &DateSpan) -> Option<DateSpan> {
        DateSpan::try_new(self.start.max(other.start), self.end.min(other.end)).ok()
    }
}

// ── Weekly schedule ──────────────────────────────────────────────

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

const SHORT_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Set of weekdays, one bit per day starting at Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const NONE: Weekdays = Weekdays(0);
    pub const ALL: Weekdays = Weekdays(0b111_1111);
    pub const MON_TO_FRI: Weekdays = Weekdays(0b001_1111);

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn with(self, day: Weekday) -> Self {
        Weekdays(self.0 | Self::bit(day))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = Weekday> {
        WEEK.into_iter().filter(move |d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for Weekdays {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Weekdays::NONE, Weekdays::with)
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .iter()
            .map(|d| SHORT_NAMES[d.num_days_from_monday() as usize])
            .collect();
        write!(f, "{}", names.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWeekdaysError(pub String);

impl fmt::Display for ParseWeekdaysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid weekday: {:?}", self.0)
    }
}

impl std::error::Error for ParseWeekdaysError {}

/// Accepts `all`, comma lists (`mon,wed,fri`), ranges (`mon-fri`) and
/// wrap-around ranges (`fri-mon`). Short or full day names, any case.
impl FromStr for Weekdays {
    type Err = ParseWeekdaysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") || s == "*" {
            return Ok(Weekdays::ALL);
        }
        let mut days = Weekdays::NONE;
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.split_once('-') {
                Some((from, to)) => {
                    let to = parse_weekday(to)?;
                    let mut day = parse_weekday(from)?;
                    loop {
                        days = days.with(day);
                        if day == to {
                            break;
                        }
                        day = day.succ();
                    }
                }
                None => days = days.with(parse_weekday(token)?),
            }
        }
        Ok(days)
    }
}

fn parse_weekday(s: &str) -> Result<Weekday, ParseWeekdaysError> {
    let s = s.trim();
    s.parse::<Weekday>()
        .map_err(|_| ParseWeekdaysError(s.to_string()))
}

/// Recurring availability: the weekdays a vehicle is open plus one daily
/// open/close pair in the pickup location's wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklySchedule {
    pub days: Weekdays,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for WeeklySchedule {
    fn default() -> Self {
        Self {
            days: Weekdays::ALL,
            start: NaiveTime::from_hms_opt(8, 0, 0).expect("constant time is valid"),
            end: NaiveTime::from_hms_opt(20, 0, 0).expect("constant time is valid"),
        }
    }
}

impl WeeklySchedule {
    pub fn opens_on(&self, day: CalendarDate) -> bool {
        self.days.contains(day.weekday())
    }
}

/// Host's single-date exception to the weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub date: CalendarDate,
    pub available: bool,
}

// ── Vehicles ─────────────────────────────────────────────────────

/// An authenticated principal: renter or host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Ulid,
    pub owner: Identity,
    pub name: Option<String>,
    pub schedule: WeeklySchedule,
    /// At most one entry per date; upserts replace.
    pub overrides: BTreeMap<CalendarDate, bool>,
    /// Offset of the pickup location from UTC.
    pub utc_offset_secs: i32,
}

impl Vehicle {
    pub fn new(id: Ulid, owner: Identity) -> Self {
        Self {
            id,
            owner,
            name: None,
            schedule: WeeklySchedule::default(),
            overrides: BTreeMap::new(),
            utc_offset_secs: 0,
        }
    }

    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    pub fn overrides(&self) -> Vec<AvailabilityOverride> {
        self.overrides
            .iter()
            .map(|(date, available)| AvailabilityOverride {
                date: *date,
                available: *available,
            })
            .collect()
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Rejected => "rejected",
        }
    }

    /// Whether a booking in this status takes its days off the calendar.
    /// Pending requests already block.
    pub fn occupies(self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::Rejected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected
        )
    }

    /// Lifecycle edges:
    /// `pending → confirmed → completed`, `pending → rejected`,
    /// `pending | confirmed → cancelled`.
    pub fn can_become(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Rejected)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, Completed)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "rejected" => Ok(BookingStatus::Rejected),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// A booking before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingDraft {
    pub vehicle_id: Ulid,
    pub requester: Identity,
    pub start_date: CalendarDate,
    pub end_date: CalendarDate,
    pub pickup_time: Option<NaiveTime>,
    pub return_time: Option<NaiveTime>,
    pub note: Option<String>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub requester: Identity,
    pub start_date: CalendarDate,
    pub end_date: CalendarDate,
    /// Pickup/return times are metadata; conflicts are decided per day.
    pub pickup_time: Option<NaiveTime>,
    pub return_time: Option<NaiveTime>,
    pub note: Option<String>,
    pub status: BookingStatus,
    pub decision_note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn from_draft(id: Ulid, draft: BookingDraft) -> Self {
        Self {
            id,
            vehicle_id: draft.vehicle_id,
            requester: draft.requester,
            start_date: draft.start_date,
            end_date: draft.end_date,
            pickup_time: draft.pickup_time,
            return_time: draft.return_time,
            note: draft.note,
            status: draft.status,
            decision_note: None,
            created_at: draft.created_at,
        }
    }

    pub fn span(&self) -> DateSpan {
        DateSpan::new(self.start_date, self.end_date)
    }

    /// True if this booking takes `day` off the calendar.
    pub fn occupies(&self, day: CalendarDate) -> bool {
        self.status.occupies() && self.span().contains(day)
    }
}

/// Derived per-day status. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DayStatus {
    Available,
    Unavailable,
    Booked,
}

impl DayStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DayStatus::Available => "available",
            DayStatus::Unavailable => "unavailable",
            DayStatus::Booked => "booked",
        }
    }
}

impl fmt::Display for DayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Store state ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    /// Every booking ever written for the vehicle, sorted by `start_date`.
    pub bookings: Vec<Booking>,
    /// Set under the write lock when the vehicle is removed. Writers that
    /// fetched the state before the removal must not append to it.
    pub deleted: bool,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            bookings: Vec::new(),
            deleted: false,
        }
    }

    /// Insert keeping `start_date` order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.start_date <= booking.start_date);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings of any status whose range shares a day with `query`.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateSpan) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.start_date <= query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.end_date >= query.start)
    }

    /// Pending or confirmed bookings still hold the vehicle.
    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(|b| {
            matches!(b.status, BookingStatus::Pending | BookingStatus::Confirmed)
        })
    }
}

/// WAL record format. Flat except for whole booking records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleCreated {
        id: Ulid,
        owner: Identity,
        name: Option<String>,
        schedule: WeeklySchedule,
        utc_offset_secs: i32,
    },
    ScheduleUpdated {
        id: Ulid,
        schedule: WeeklySchedule,
    },
    OverrideSet {
        vehicle_id: Ulid,
        date: CalendarDate,
        available: bool,
    },
    OverrideCleared {
        vehicle_id: Ulid,
        date: CalendarDate,
    },
    VehicleDeleted {
        id: Ulid,
    },
    BookingWritten {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        vehicle_id: Ulid,
        status: BookingStatus,
        note: Option<String>,
    },
}

impl Event {
    pub fn vehicle_id(&self) -> Ulid {
        match self {
            Event::VehicleCreated { id, .. }
            | Event::ScheduleUpdated { id, .. }
            | Event::VehicleDeleted { id } => *id,
            Event::OverrideSet { vehicle_id, .. }
            | Event::OverrideCleared { vehicle_id, .. }
            | Event::BookingStatusChanged { vehicle_id, .. } => *vehicle_id,
            Event::BookingWritten { booking } => booking.vehicle_id,
        }
    }
}
