//! Hard ceilings on per-tenant state and per-request work.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_VEHICLES_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_VEHICLE: usize = 10_000;
pub const MAX_OVERRIDES_PER_VEHICLE: usize = 3_660;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTE_LEN: usize = 1024;
pub const MAX_CHANNEL_LEN: usize = 128;

/// Longest booking, in calendar days including both ends.
pub const MAX_BOOKING_DAYS: i64 = 366;
/// Furthest look-ahead for the disabled-date set.
pub const MAX_HORIZON_DAYS: u32 = 730;
pub const DEFAULT_HORIZON_DAYS: u32 = 365;
/// Most months in one listing-card summary.
pub const MAX_SUMMARY_MONTHS: u32 = 24;

/// Vehicle UTC offsets must stay strictly inside one day.
pub const MAX_UTC_OFFSET_SECS: i32 = 86_399;
