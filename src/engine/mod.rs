mod availability;
mod conflict;
pub mod dates;
mod error;
mod mutations;
mod queries;

pub use availability::{
    merge_spans, project_month, schedule_status, status_of, summarize_months, AvailabilityView,
    MonthSummary,
};
pub use conflict::{confirmed_clashes, disabled_dates, is_bookable, Bookability, Clash, DisabledDates};
pub use error::EngineError;
pub use mutations::{BookingRequest, Submission};

use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::Dispatcher;
use crate::store::Store;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Availability and booking engine for one tenant.
///
/// Holds no booking state of its own: every call reads a fresh snapshot
/// from the store, so results are never stale relative to other writers.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) clock: Arc<dyn Clock>,
    write_timeout: Duration,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Bound on how long `submit` waits for the booking write.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Today in the vehicle's local calendar.
    pub fn today_for(&self, vehicle: &Vehicle) -> CalendarDate {
        dates::normalize(self.clock.now(), vehicle.local_offset())
    }

    pub(crate) async fn vehicle_and_bookings(
        &self,
        vehicle_id: Ulid,
    ) -> Result<(Vehicle, Vec<Booking>), EngineError> {
        let vehicle = self.store.read_vehicle(vehicle_id).await?;
        let bookings = self.store.read_bookings(vehicle_id).await?;
        Ok((vehicle, bookings))
    }

    /// The vehicle, if `actor` owns it.
    pub(crate) async fn owned_vehicle(
        &self,
        vehicle_id: Ulid,
        actor: &Identity,
    ) -> Result<Vehicle, EngineError> {
        let vehicle = self.store.read_vehicle(vehicle_id).await?;
        if &vehicle.owner != actor {
            return Err(EngineError::NotPermitted {
                actor: actor.clone(),
            });
        }
        Ok(vehicle)
    }
}
