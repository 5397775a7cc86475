use ulid::Ulid;

use crate::limits::DEFAULT_HORIZON_DAYS;
use crate::model::*;

use super::availability::{self, MonthSummary};
use super::conflict::{self, Bookability, DisabledDates};
use super::dates::month_span;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_vehicle(&self, id: Ulid) -> Result<Vehicle, EngineError> {
        self.store.read_vehicle(id).await
    }

    pub async fn list_vehicles(&self) -> Vec<Vehicle> {
        self.store.list_vehicles().await
    }

    pub async fn overrides(&self, vehicle_id: Ulid) -> Result<Vec<AvailabilityOverride>, EngineError> {
        Ok(self.store.read_vehicle(vehicle_id).await?.overrides())
    }

    pub async fn bookings(&self, vehicle_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.store.read_bookings(vehicle_id).await
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.store.read_booking(id).await
    }

    pub async fn status_of(&self, vehicle_id: Ulid, day: CalendarDate) -> Result<DayStatus, EngineError> {
        let vehicle = self.store.read_vehicle(vehicle_id).await?;
        let bookings = self
            .store
            .read_bookings_between(vehicle_id, DateSpan::single(day))
            .await?;
        Ok(availability::status_of(&vehicle, &bookings, day))
    }

    pub async fn project_month(
        &self,
        vehicle_id: Ulid,
        year: i32,
        month: u32,
    ) -> Result<Vec<(CalendarDate, DayStatus)>, EngineError> {
        let window = month_span(year, month)?;
        let vehicle = self.store.read_vehicle(vehicle_id).await?;
        let bookings = self.store.read_bookings_between(vehicle_id, window).await?;
        availability::project_month(&vehicle, &bookings, year, month)
    }

    pub async fn summarize_months(
        &self,
        vehicle_id: Ulid,
        year: i32,
        month: u32,
        count: u32,
    ) -> Result<Vec<MonthSummary>, EngineError> {
        let (vehicle, bookings) = self.vehicle_and_bookings(vehicle_id).await?;
        availability::summarize_months(&vehicle, &bookings, year, month, count)
    }

    /// `is_bookable` as of today in the vehicle's local calendar.
    pub async fn is_bookable(
        &self,
        vehicle_id: Ulid,
        start: CalendarDate,
        end: CalendarDate,
    ) -> Result<Bookability, EngineError> {
        let (vehicle, bookings) = self.vehicle_and_bookings(vehicle_id).await?;
        let today = self.today_for(&vehicle);
        conflict::is_bookable(&vehicle, &bookings, start, end, today)
    }

    pub async fn is_bookable_as_of(
        &self,
        vehicle_id: Ulid,
        start: CalendarDate,
        end: CalendarDate,
        as_of: CalendarDate,
    ) -> Result<Bookability, EngineError> {
        let (vehicle, bookings) = self.vehicle_and_bookings(vehicle_id).await?;
        conflict::is_bookable(&vehicle, &bookings, start, end, as_of)
    }

    /// Dates a picker should grey out, from today for `horizon_days`.
    pub async fn disabled_dates(
        &self,
        vehicle_id: Ulid,
        horizon_days: Option<u32>,
    ) -> Result<DisabledDates, EngineError> {
        let (vehicle, bookings) = self.vehicle_and_bookings(vehicle_id).await?;
        let today = self.today_for(&vehicle);
        conflict::disabled_dates(
            &vehicle,
            &bookings,
            today,
            horizon_days.unwrap_or(DEFAULT_HORIZON_DAYS),
        )
    }

    /// Confirmed bookings across all vehicles, soonest return first.
    ///
    /// Display view for return tracking. Pending requests are left out here
    /// even though they block the calendar.
    pub async fn active_rentals(&self) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::new();
        for vehicle in self.store.list_vehicles().await {
            let bookings = match self.store.read_bookings(vehicle.id).await {
                Ok(b) => b,
                // Deleted between listing and reading.
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            out.extend(
                bookings
                    .into_iter()
                    .filter(|b| b.status == BookingStatus::Confirmed),
            );
        }
        out.sort_by_key(|b| (b.end_date, b.id));
        Ok(out)
    }
}
