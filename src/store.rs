use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{confirmed_clashes, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

/// A requested status move. `from` is what the caller last saw; the store
/// refuses the change if the booking has moved on since.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub note: Option<String>,
}

/// Persistence collaborator. All booking state lives behind this.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError>;
    async fn read_vehicle(&self, id: Ulid) -> Result<Vehicle, EngineError>;
    async fn list_vehicles(&self) -> Vec<Vehicle>;
    async fn update_schedule(
        &self,
        id: Ulid,
        schedule: WeeklySchedule,
    ) -> Result<Vehicle, EngineError>;
    /// Upsert: a second override for the same date replaces the first.
    async fn set_override(
        &self,
        vehicle_id: Ulid,
        date: CalendarDate,
        available: bool,
    ) -> Result<(), EngineError>;
    /// Returns whether an override existed.
    async fn clear_override(&self, vehicle_id: Ulid, date: CalendarDate)
        -> Result<bool, EngineError>;
    async fn delete_vehicle(&self, id: Ulid) -> Result<(), EngineError>;

    /// Every booking for the vehicle, any status, sorted by start date.
    async fn read_bookings(&self, vehicle_id: Ulid) -> Result<Vec<Booking>, EngineError>;

    /// Bookings sharing at least one day with `span`.
    async fn read_bookings_between(
        &self,
        vehicle_id: Ulid,
        span: DateSpan,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut bookings = self.read_bookings(vehicle_id).await?;
        bookings.retain(|b| b.span().overlaps(&span));
        Ok(bookings)
    }

    async fn read_booking(&self, id: Ulid) -> Result<Booking, EngineError>;
    /// Persist a new booking and assign its id.
    async fn write_booking(&self, draft: BookingDraft) -> Result<Booking, EngineError>;
    async fn update_booking_status(
        &self,
        id: Ulid,
        change: StatusChange,
    ) -> Result<Booking, EngineError>;
}

pub type SharedVehicleState = Arc<RwLock<VehicleState>>;

// ── Group-commit WAL channel ─────────────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Owns the WAL. Appends that arrive while a flush is being prepared are
/// drained into the same batch and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Pending) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &Pending) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so no half-batch lingers in the buffer.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Apply one event to a vehicle. Caller holds the lock.
fn apply_to_vehicle(vs: &mut VehicleState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleUpdated { schedule, .. } => vs.vehicle.schedule = *schedule,
        Event::OverrideSet { date, available, .. } => {
            vs.vehicle.overrides.insert(*date, *available);
        }
        Event::OverrideCleared { date, .. } => {
            vs.vehicle.overrides.remove(date);
        }
        Event::BookingWritten { booking } => {
            index.insert(booking.id, booking.vehicle_id);
            vs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, note, .. } => {
            if let Some(b) = vs.booking_mut(*id) {
                b.status = *status;
                if note.is_some() {
                    b.decision_note = note.clone();
                }
            }
        }
        Event::VehicleCreated { .. } | Event::VehicleDeleted { .. } => {}
    }
}

fn vehicle_from_event(event: &Event) -> Option<Vehicle> {
    let Event::VehicleCreated {
        id,
        owner,
        name,
        schedule,
        utc_offset_secs,
    } = event
    else {
        return None;
    };
    Some(Vehicle {
        id: *id,
        owner: owner.clone(),
        name: name.clone(),
        schedule: *schedule,
        overrides: Default::default(),
        utc_offset_secs: *utc_offset_secs,
    })
}

/// Writers that fetched a vehicle before it was deleted see the flag once
/// they get the lock.
fn ensure_live(vs: &VehicleState, id: Ulid) -> Result<(), EngineError> {
    if vs.deleted {
        return Err(EngineError::NotFound(id));
    }
    Ok(())
}

/// In-memory state per vehicle, made durable by a group-commit WAL.
pub struct WalStore {
    state: DashMap<Ulid, SharedVehicleState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// booking id → vehicle id
    booking_to_vehicle: DashMap<Ulid, Ulid>,
    /// Held shared by every mutation from lock to apply, and exclusively by
    /// compaction from snapshot to file swap. Taken before any vehicle lock.
    write_gate: RwLock<()>,
}

impl WalStore {
    /// Replay the log at `path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_to_vehicle = DashMap::new();
        let mut vehicles: HashMap<Ulid, VehicleState> = HashMap::new();
        for event in &events {
            match event {
                Event::VehicleCreated { id, .. } => {
                    if let Some(v) = vehicle_from_event(event) {
                        vehicles.insert(*id, VehicleState::new(v));
                    }
                }
                Event::VehicleDeleted { id } => {
                    if let Some(vs) = vehicles.remove(id) {
                        for b in &vs.bookings {
                            booking_to_vehicle.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(vs) = vehicles.get_mut(&other.vehicle_id()) {
                        apply_to_vehicle(vs, other, &booking_to_vehicle);
                    }
                }
            }
        }
        debug!(
            path = %path.display(),
            events = events.len(),
            vehicles = vehicles.len(),
            "replayed WAL"
        );

        let state = DashMap::new();
        for (id, vs) in vehicles {
            state.insert(id, Arc::new(RwLock::new(vs)));
        }
        Ok(Self {
            state,
            wal_tx,
            booking_to_vehicle,
            write_gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    fn get_vehicle(&self, id: Ulid) -> Result<SharedVehicleState, EngineError> {
        self.state
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// WAL append, then apply under the caller's lock.
    async fn persist_and_apply(
        &self,
        vs: &mut VehicleState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_vehicle(vs, event, &self.booking_to_vehicle);
        Ok(())
    }

    /// Booking id → vehicle write lock.
    async fn resolve_booking_write(
        &self,
        booking_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<VehicleState>, EngineError> {
        let vehicle_id = self
            .booking_to_vehicle
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(self.get_vehicle(vehicle_id)?.write_owned().await)
    }

    pub fn vehicle_count(&self) -> usize {
        self.state.len()
    }

    /// Rewrite the log as the minimal event set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // No append may be acknowledged between the snapshot and the swap.
        let _gate = self.write_gate.write().await;
        let arcs: Vec<SharedVehicleState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for arc in arcs {
            let vs = arc.read().await;
            if vs.deleted {
                continue;
            }
            let v = &vs.vehicle;
            events.push(Event::VehicleCreated {
                id: v.id,
                owner: v.owner.clone(),
                name: v.name.clone(),
                schedule: v.schedule,
                utc_offset_secs: v.utc_offset_secs,
            });
            for (date, available) in &v.overrides {
                events.push(Event::OverrideSet {
                    vehicle_id: v.id,
                    date: *date,
                    available: *available,
                });
            }
            for booking in &vs.bookings {
                events.push(Event::BookingWritten {
                    booking: booking.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl Store for WalStore {
    async fn create_vehicle(&self, vehicle: Vehicle) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let id = vehicle.id;
        let event = Event::VehicleCreated {
            id,
            owner: vehicle.owner.clone(),
            name: vehicle.name.clone(),
            schedule: vehicle.schedule,
            utc_offset_secs: vehicle.utc_offset_secs,
        };
        let mut vs = VehicleState::new(vehicle);
        // Overrides only enter through their own events.
        vs.vehicle.overrides.clear();
        let arc = Arc::new(RwLock::new(vs));
        // Locked before it becomes visible: readers wait until the create
        // is durable, and a second create of the same id finds the slot taken.
        let mut reserved = arc.clone().write_owned().await;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(arc);
            }
        }
        let committed = if self.state.len() > MAX_VEHICLES_PER_TENANT {
            Err(EngineError::LimitExceeded("too many vehicles"))
        } else {
            self.wal_append(&event).await
        };
        if let Err(e) = committed {
            reserved.deleted = true;
            self.state.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn read_vehicle(&self, id: Ulid) -> Result<Vehicle, EngineError> {
        let arc = self.get_vehicle(id)?;
        let vs = arc.read().await;
        ensure_live(&vs, id)?;
        Ok(vs.vehicle.clone())
    }

    async fn list_vehicles(&self) -> Vec<Vehicle> {
        let arcs: Vec<SharedVehicleState> =
            self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let vs = arc.read().await;
            if !vs.deleted {
                out.push(vs.vehicle.clone());
            }
        }
        out.sort_by_key(|v| v.id);
        out
    }

    async fn update_schedule(
        &self,
        id: Ulid,
        schedule: WeeklySchedule,
    ) -> Result<Vehicle, EngineError> {
        let _gate = self.write_gate.read().await;
        let arc = self.get_vehicle(id)?;
        let mut vs = arc.write().await;
        ensure_live(&vs, id)?;
        self.persist_and_apply(&mut vs, &Event::ScheduleUpdated { id, schedule })
            .await?;
        Ok(vs.vehicle.clone())
    }

    async fn set_override(
        &self,
        vehicle_id: Ulid,
        date: CalendarDate,
        available: bool,
    ) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let arc = self.get_vehicle(vehicle_id)?;
        let mut vs = arc.write().await;
        ensure_live(&vs, vehicle_id)?;
        if !vs.vehicle.overrides.contains_key(&date)
            && vs.vehicle.overrides.len() >= MAX_OVERRIDES_PER_VEHICLE
        {
            return Err(EngineError::LimitExceeded("too many overrides on vehicle"));
        }
        let event = Event::OverrideSet {
            vehicle_id,
            date,
            available,
        };
        self.persist_and_apply(&mut vs, &event).await
    }

    async fn clear_override(
        &self,
        vehicle_id: Ulid,
        date: CalendarDate,
    ) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        let arc = self.get_vehicle(vehicle_id)?;
        let mut vs = arc.write().await;
        ensure_live(&vs, vehicle_id)?;
        if !vs.vehicle.overrides.contains_key(&date) {
            return Ok(false);
        }
        self.persist_and_apply(&mut vs, &Event::OverrideCleared { vehicle_id, date })
            .await?;
        Ok(true)
    }

    async fn delete_vehicle(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let arc = self.get_vehicle(id)?;
        let mut vs = arc.write().await;
        ensure_live(&vs, id)?;
        if vs.has_active_bookings() {
            return Err(EngineError::HasActiveBookings(id));
        }
        self.wal_append(&Event::VehicleDeleted { id }).await?;
        vs.deleted = true;
        for b in &vs.bookings {
            self.booking_to_vehicle.remove(&b.id);
        }
        drop(vs);
        self.state.remove(&id);
        Ok(())
    }

    async fn read_bookings(&self, vehicle_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        let arc = self.get_vehicle(vehicle_id)?;
        let vs = arc.read().await;
        Ok(vs.bookings.clone())
    }

    async fn read_bookings_between(
        &self,
        vehicle_id: Ulid,
        span: DateSpan,
    ) -> Result<Vec<Booking>, EngineError> {
        let arc = self.get_vehicle(vehicle_id)?;
        let vs = arc.read().await;
        Ok(vs.overlapping(&span).cloned().collect())
    }

    async fn read_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let vehicle_id = self
            .booking_to_vehicle
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let arc = self.get_vehicle(vehicle_id)?;
        let vs = arc.read().await;
        vs.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    async fn write_booking(&self, draft: BookingDraft) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let arc = self.get_vehicle(draft.vehicle_id)?;
        let mut vs = arc.write().await;
        ensure_live(&vs, draft.vehicle_id)?;
        if vs.bookings.len() >= MAX_BOOKINGS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many bookings on vehicle"));
        }
        let booking = Booking::from_draft(Ulid::new(), draft);
        let event = Event::BookingWritten {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut vs, &event).await?;
        Ok(booking)
    }

    /// Confirmations are re-checked against other confirmed bookings while
    /// the vehicle lock is held, so two racing confirms cannot both land.
    async fn update_booking_status(
        &self,
        id: Ulid,
        change: StatusChange,
    ) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut vs = self.resolve_booking_write(id).await?;
        ensure_live(&vs, id)?;
        let current = vs.booking(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status != change.from {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: change.to,
            });
        }
        if change.to == BookingStatus::Confirmed {
            if let Some(clash) = confirmed_clashes(&current, &vs.bookings).into_iter().next() {
                return Err(EngineError::StaleConfirmation {
                    booking_id: id,
                    conflicting_id: clash.booking_id,
                    dates: clash.dates,
                });
            }
        }
        let event = Event::BookingStatusChanged {
            id,
            vehicle_id: current.vehicle_id,
            status: change.to,
            note: change.note,
        };
        self.persist_and_apply(&mut vs, &event).await?;
        vs.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetcal_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn d(day: u32) -> CalendarDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn draft(vehicle_id: Ulid, start: u32, end: u32) -> BookingDraft {
        BookingDraft {
            vehicle_id,
            requester: Identity::new("renter"),
            start_date: d(start),
            end_date: d(end),
            pickup_time: None,
            return_time: None,
            note: None,
            status: BookingStatus::Pending,
            created_at: Utc::now(),
        }
    }

    async fn store_with_vehicle(name: &str) -> (WalStore, Ulid, PathBuf) {
        let path = test_wal_path(name);
        let store = WalStore::open(&path).unwrap();
        let vid = Ulid::new();
        store
            .create_vehicle(Vehicle::new(vid, Identity::new("host")))
            .await
            .unwrap();
        (store, vid, path)
    }

    #[tokio::test]
    async fn duplicate_vehicle_is_rejected() {
        let (store, vid, _) = store_with_vehicle("dup_vehicle.wal").await;
        let err = store
            .create_vehicle(Vehicle::new(vid, Identity::new("host")))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::AlreadyExists(vid));
    }

    #[tokio::test]
    async fn override_upsert_keeps_one_entry() {
        let (store, vid, _) = store_with_vehicle("override_upsert.wal").await;
        store.set_override(vid, d(4), false).await.unwrap();
        store.set_override(vid, d(4), true).await.unwrap();
        let v = store.read_vehicle(vid).await.unwrap();
        assert_eq!(v.overrides.len(), 1);
        assert_eq!(v.overrides.get(&d(4)), Some(&true));

        assert!(store.clear_override(vid, d(4)).await.unwrap());
        assert!(!store.clear_override(vid, d(4)).await.unwrap());
    }

    #[tokio::test]
    async fn bookings_come_back_sorted_and_filtered() {
        let (store, vid, _) = store_with_vehicle("bookings_sorted.wal").await;
        store.write_booking(draft(vid, 20, 22)).await.unwrap();
        store.write_booking(draft(vid, 1, 3)).await.unwrap();
        store.write_booking(draft(vid, 10, 12)).await.unwrap();

        let all = store.read_bookings(vid).await.unwrap();
        let starts: Vec<_> = all.iter().map(|b| b.start_date).collect();
        assert_eq!(starts, vec![d(1), d(10), d(20)]);

        let window = store
            .read_bookings_between(vid, DateSpan::new(d(3), d(10)))
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn stale_status_change_is_refused() {
        let (store, vid, _) = store_with_vehicle("stale_change.wal").await;
        let b = store.write_booking(draft(vid, 1, 3)).await.unwrap();
        let cancel = StatusChange {
            from: BookingStatus::Pending,
            to: BookingStatus::Cancelled,
            note: None,
        };
        store.update_booking_status(b.id, cancel.clone()).await.unwrap();
        let err = store.update_booking_status(b.id, cancel).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidTransition {
                id: b.id,
                from: BookingStatus::Cancelled,
                to: BookingStatus::Cancelled,
            }
        );
    }

    #[tokio::test]
    async fn confirm_is_rechecked_under_lock() {
        let (store, vid, _) = store_with_vehicle("confirm_recheck.wal").await;
        let first = store.write_booking(draft(vid, 1, 5)).await.unwrap();
        let second = store.write_booking(draft(vid, 4, 8)).await.unwrap();
        let confirm = StatusChange {
            from: BookingStatus::Pending,
            to: BookingStatus::Confirmed,
            note: None,
        };
        store.update_booking_status(first.id, confirm.clone()).await.unwrap();
        let err = store.update_booking_status(second.id, confirm).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::StaleConfirmation {
                booking_id: second.id,
                conflicting_id: first.id,
                dates: vec![d(4), d(5)],
            }
        );
    }

    #[tokio::test]
    async fn delete_is_blocked_by_active_bookings() {
        let (store, vid, _) = store_with_vehicle("delete_guard.wal").await;
        let b = store.write_booking(draft(vid, 1, 3)).await.unwrap();
        assert_eq!(
            store.delete_vehicle(vid).await.unwrap_err(),
            EngineError::HasActiveBookings(vid)
        );
        store
            .update_booking_status(
                b.id,
                StatusChange {
                    from: BookingStatus::Pending,
                    to: BookingStatus::Rejected,
                    note: Some("maintenance".into()),
                },
            )
            .await
            .unwrap();
        store.delete_vehicle(vid).await.unwrap();
        assert_eq!(store.read_booking(b.id).await.unwrap_err(), EngineError::NotFound(b.id));
        assert_eq!(store.vehicle_count(), 0);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let (store, vid, path) = store_with_vehicle("reopen.wal").await;
        store.set_override(vid, d(9), false).await.unwrap();
        let b = store.write_booking(draft(vid, 1, 3)).await.unwrap();
        store
            .update_booking_status(
                b.id,
                StatusChange {
                    from: BookingStatus::Pending,
                    to: BookingStatus::Rejected,
                    note: Some("maintenance".into()),
                },
            )
            .await
            .unwrap();
        drop(store);

        let reopened = WalStore::open(&path).unwrap();
        let v = reopened.read_vehicle(vid).await.unwrap();
        assert_eq!(v.overrides.get(&d(9)), Some(&false));
        let got = reopened.read_booking(b.id).await.unwrap();
        assert_eq!(got.status, BookingStatus::Rejected);
        assert_eq!(got.decision_note.as_deref(), Some("maintenance"));
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let (store, vid, path) = store_with_vehicle("compact_state.wal").await;
        for day in 1..=10 {
            store.set_override(vid, d(day), false).await.unwrap();
            store.clear_override(vid, d(day)).await.unwrap();
        }
        let b = store.write_booking(draft(vid, 12, 14)).await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 22);

        store.compact_wal().await.unwrap();
        assert_eq!(store.wal_appends_since_compact().await, 0);
        drop(store);

        let replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        let reopened = WalStore::open(&path).unwrap();
        assert_eq!(reopened.read_booking(b.id).await.unwrap().start_date, d(12));
        assert!(reopened.read_vehicle(vid).await.unwrap().overrides.is_empty());
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn booking_written_during_compaction_survives_reopen() {
        let (store, first, path) = store_with_vehicle("compact_race.wal").await;
        let second = Ulid::new();
        store
            .create_vehicle(Vehicle::new(second, Identity::new("host")))
            .await
            .unwrap();
        let store = Arc::new(store);

        // Stall the snapshot on the second vehicle while a booking for the
        // first one is submitted.
        let held = store.get_vehicle(second).unwrap().write_owned().await;
        let compacting = tokio::spawn({
            let store = store.clone();
            async move { store.compact_wal().await }
        });
        settle().await;
        let writing = tokio::spawn({
            let store = store.clone();
            async move { store.write_booking(draft(first, 1, 3)).await }
        });
        settle().await;
        drop(held);

        compacting.await.unwrap().unwrap();
        let booking = writing.await.unwrap().unwrap();
        drop(store);

        let reopened = WalStore::open(&path).unwrap();
        let got = reopened.read_booking(booking.id).await.unwrap();
        assert_eq!((got.vehicle_id, got.start_date), (first, d(1)));
        assert_eq!(reopened.vehicle_count(), 2);
    }

    #[tokio::test]
    async fn write_queued_behind_delete_is_refused() {
        let (store, vid, _) = store_with_vehicle("delete_race.wal").await;
        let store = Arc::new(store);

        let reader = store.get_vehicle(vid).unwrap().read_owned().await;
        let deleting = tokio::spawn({
            let store = store.clone();
            async move { store.delete_vehicle(vid).await }
        });
        settle().await;
        let writing = tokio::spawn({
            let store = store.clone();
            async move { store.write_booking(draft(vid, 1, 3)).await }
        });
        settle().await;
        drop(reader);

        assert_eq!(deleting.await.unwrap(), Ok(()));
        assert_eq!(writing.await.unwrap().unwrap_err(), EngineError::NotFound(vid));
        assert!(store.read_bookings(vid).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_creates_keep_first_owner() {
        let path = test_wal_path("create_race.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let vid = Ulid::new();

        let create = |owner: &'static str| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .create_vehicle(Vehicle::new(vid, Identity::new(owner)))
                    .await
                    .map(|()| owner)
            })
        };
        let (a, b) = (create("alice"), create("mallory"));
        let results = [a.await.unwrap(), b.await.unwrap()];

        let winners: Vec<&str> = results.iter().filter_map(|r| r.clone().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results.contains(&Err(EngineError::AlreadyExists(vid))));
        let owner = store.read_vehicle(vid).await.unwrap().owner;
        assert_eq!(owner, Identity::new(winners[0]));
        assert_eq!(store.vehicle_count(), 1);
    }
}
