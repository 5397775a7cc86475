use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::IdentityProvider;
use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyOutcome;
use crate::observability as obs;
use crate::store::StatusChange;

use super::conflict::{self, confirmed_clashes};
use super::dates::normalize;
use super::{Engine, EngineError};

/// What a renter asks for. Dates are local calendar days at pickup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub start_date: CalendarDate,
    pub end_date: CalendarDate,
    pub pickup_time: Option<NaiveTime>,
    pub return_time: Option<NaiveTime>,
    pub note: Option<String>,
    /// Preferred notification channel; the vehicle channel is the fallback.
    pub channel: Option<String>,
}

impl BookingRequest {
    pub fn new(start_date: CalendarDate, end_date: CalendarDate) -> Self {
        Self {
            start_date,
            end_date,
            pickup_time: None,
            return_time: None,
            note: None,
            channel: None,
        }
    }

    /// From pickup and return instants, split into local day and wall time.
    pub fn from_instants(
        pickup: DateTime<Utc>,
        dropoff: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            start_date: normalize(pickup, offset),
            end_date: normalize(dropoff, offset),
            pickup_time: Some(pickup.with_timezone(&offset).time()),
            return_time: Some(dropoff.with_timezone(&offset).time()),
            note: None,
            channel: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

/// A stored booking plus the advisory notification result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub booking: Booking,
    pub notification: NotifyOutcome,
}

fn validate_schedule(schedule: &WeeklySchedule) -> Result<(), EngineError> {
    if schedule.days.is_empty() {
        return Err(EngineError::InvalidSchedule("at least one weekday is required"));
    }
    if schedule.start >= schedule.end {
        return Err(EngineError::InvalidSchedule("opening time must precede closing time"));
    }
    Ok(())
}

fn check_len(value: Option<&str>, max: usize, what: &'static str) -> Result<(), EngineError> {
    match value {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Host calendar editing ────────────────────────────────────

    pub async fn create_vehicle(
        &self,
        id: Ulid,
        owner: &Identity,
        name: Option<String>,
        schedule: WeeklySchedule,
        utc_offset_secs: i32,
    ) -> Result<Vehicle, EngineError> {
        check_len(name.as_deref(), MAX_NAME_LEN, "vehicle name too long")?;
        if utc_offset_secs.abs() > MAX_UTC_OFFSET_SECS {
            return Err(EngineError::LimitExceeded("utc offset out of range"));
        }
        validate_schedule(&schedule)?;
        let vehicle = Vehicle {
            name,
            schedule,
            utc_offset_secs,
            ..Vehicle::new(id, owner.clone())
        };
        self.store.create_vehicle(vehicle.clone()).await?;
        info!(vehicle = %id, owner = %owner, "vehicle created");
        Ok(vehicle)
    }

    /// Replaces the weekly schedule. Existing bookings are untouched and
    /// keep their days booked.
    pub async fn update_schedule(
        &self,
        vehicle_id: Ulid,
        actor: &Identity,
        schedule: WeeklySchedule,
    ) -> Result<Vehicle, EngineError> {
        validate_schedule(&schedule)?;
        self.owned_vehicle(vehicle_id, actor).await?;
        self.store.update_schedule(vehicle_id, schedule).await
    }

    pub async fn set_override(
        &self,
        vehicle_id: Ulid,
        actor: &Identity,
        date: CalendarDate,
        available: bool,
    ) -> Result<(), EngineError> {
        self.owned_vehicle(vehicle_id, actor).await?;
        self.store.set_override(vehicle_id, date, available).await
    }

    pub async fn clear_override(
        &self,
        vehicle_id: Ulid,
        actor: &Identity,
        date: CalendarDate,
    ) -> Result<bool, EngineError> {
        self.owned_vehicle(vehicle_id, actor).await?;
        self.store.clear_override(vehicle_id, date).await
    }

    pub async fn delete_vehicle(&self, vehicle_id: Ulid, actor: &Identity) -> Result<(), EngineError> {
        self.owned_vehicle(vehicle_id, actor).await?;
        self.store.delete_vehicle(vehicle_id).await?;
        info!(vehicle = %vehicle_id, "vehicle deleted");
        Ok(())
    }

    // ── Booking workflow ─────────────────────────────────────────

    /// Validate, persist as `pending`, then notify.
    ///
    /// Validation errors win over a missing login so a signed-out renter
    /// still learns which dates are taken. The check and the write are not
    /// atomic; overlapping pending requests are settled at `confirm`.
    ///
    /// On `WriteTimeout` the booking may still have been stored; callers
    /// should re-read rather than assume failure.
    pub async fn submit(
        &self,
        session: &dyn IdentityProvider,
        vehicle_id: Ulid,
        request: BookingRequest,
    ) -> Result<Submission, EngineError> {
        check_len(request.note.as_deref(), MAX_NOTE_LEN, "note too long")?;
        check_len(request.channel.as_deref(), MAX_CHANNEL_LEN, "channel name too long")?;

        let (vehicle, bookings) = self.vehicle_and_bookings(vehicle_id).await?;
        let today = self.today_for(&vehicle);
        let checked = conflict::is_bookable(
            &vehicle,
            &bookings,
            request.start_date,
            request.end_date,
            today,
        )
        .and_then(|b| b.into_result());
        if let Err(e) = checked {
            metrics::counter!(obs::SUBMISSIONS_REFUSED_TOTAL, "reason" => obs::error_label(&e))
                .increment(1);
            return Err(e);
        }

        let requester = session
            .current_requester()
            .ok_or(EngineError::AuthenticationRequired)?;

        let draft = BookingDraft {
            vehicle_id,
            requester,
            start_date: request.start_date,
            end_date: request.end_date,
            pickup_time: request.pickup_time,
            return_time: request.return_time,
            note: request.note,
            status: BookingStatus::Pending,
            created_at: self.clock.now(),
        };
        let booking = tokio::time::timeout(self.write_timeout, self.store.write_booking(draft))
            .await
            .map_err(|_| {
                warn!(vehicle = %vehicle_id, "booking write timed out");
                EngineError::WriteTimeout
            })??;
        metrics::counter!(obs::BOOKINGS_SUBMITTED_TOTAL).increment(1);
        info!(
            booking = %booking.id,
            vehicle = %vehicle_id,
            requester = %booking.requester,
            start = %booking.start_date,
            end = %booking.end_date,
            "booking submitted"
        );

        let notification = self
            .dispatcher
            .notify(&booking, request.channel.as_deref())
            .await;
        if !notification.success {
            metrics::counter!(obs::NOTIFY_FAILURES_TOTAL).increment(1);
            warn!(booking = %booking.id, "submission notice not delivered");
        }
        Ok(Submission {
            booking,
            notification,
        })
    }

    /// Host accepts a pending request, unless a confirmed booking already
    /// holds any of its days.
    pub async fn confirm(&self, booking_id: Ulid, host: &Identity) -> Result<Booking, EngineError> {
        let booking = self.store.read_booking(booking_id).await?;
        self.owned_vehicle(booking.vehicle_id, host).await?;
        if !booking.status.can_become(BookingStatus::Confirmed) {
            return Err(EngineError::InvalidTransition {
                id: booking_id,
                from: booking.status,
                to: BookingStatus::Confirmed,
            });
        }
        let others = self.store.read_bookings(booking.vehicle_id).await?;
        if let Some(clash) = confirmed_clashes(&booking, &others).into_iter().next() {
            metrics::counter!(obs::STALE_CONFIRMATIONS_TOTAL).increment(1);
            return Err(EngineError::StaleConfirmation {
                booking_id,
                conflicting_id: clash.booking_id,
                dates: clash.dates,
            });
        }
        self.transition(&booking, BookingStatus::Confirmed, None).await
    }

    pub async fn reject(
        &self,
        booking_id: Ulid,
        host: &Identity,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        check_len(reason.as_deref(), MAX_NOTE_LEN, "reason too long")?;
        let booking = self.store.read_booking(booking_id).await?;
        self.owned_vehicle(booking.vehicle_id, host).await?;
        self.transition(&booking, BookingStatus::Rejected, reason).await
    }

    /// Either the renter or the host may cancel.
    pub async fn cancel(&self, booking_id: Ulid, actor: &Identity) -> Result<Booking, EngineError> {
        let booking = self.store.read_booking(booking_id).await?;
        if &booking.requester != actor {
            self.owned_vehicle(booking.vehicle_id, actor).await?;
        }
        self.transition(&booking, BookingStatus::Cancelled, None).await
    }

    /// Host marks a confirmed rental returned once its last day has passed.
    pub async fn complete(&self, booking_id: Ulid, host: &Identity) -> Result<Booking, EngineError> {
        let booking = self.store.read_booking(booking_id).await?;
        let vehicle = self.owned_vehicle(booking.vehicle_id, host).await?;
        if booking.status == BookingStatus::Confirmed && booking.end_date >= self.today_for(&vehicle) {
            return Err(EngineError::ReturnNotDue {
                id: booking_id,
                end_date: booking.end_date,
            });
        }
        self.transition(&booking, BookingStatus::Completed, None).await
    }

    /// Complete every confirmed booking whose return date has passed.
    pub async fn complete_elapsed(&self) -> Result<Vec<Booking>, EngineError> {
        let mut completed = Vec::new();
        for vehicle in self.store.list_vehicles().await {
            let today = self.today_for(&vehicle);
            let bookings = match self.store.read_bookings(vehicle.id).await {
                Ok(b) => b,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let due = bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Confirmed && b.end_date < today);
            for booking in due {
                match self.transition(booking, BookingStatus::Completed, None).await {
                    Ok(b) => completed.push(b),
                    // Cancelled or completed by someone else meanwhile.
                    Err(e @ (EngineError::InvalidTransition { .. } | EngineError::NotFound(_))) => {
                        debug!(booking = %booking.id, "completion skipped: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(completed)
    }

    async fn transition(
        &self,
        booking: &Booking,
        to: BookingStatus,
        note: Option<String>,
    ) -> Result<Booking, EngineError> {
        let from = booking.status;
        if !from.can_become(to) {
            return Err(EngineError::InvalidTransition {
                id: booking.id,
                from,
                to,
            });
        }
        let updated = self
            .store
            .update_booking_status(booking.id, StatusChange { from, to, note })
            .await?;
        metrics::counter!(obs::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!(booking = %booking.id, %from, %to, "booking status changed");

        let outcome = self.dispatcher.notify(&updated, None).await;
        if !outcome.success {
            debug!(booking = %booking.id, "status notice not delivered");
        }
        Ok(updated)
    }
}
