use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::store::WalStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that marks confirmed rentals completed once their
/// return date has passed.
pub async fn run_completer(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// One sweep. Returns how many bookings were completed.
pub async fn sweep_once(engine: &Engine) -> usize {
    match engine.complete_elapsed().await {
        Ok(done) => {
            for b in &done {
                info!(booking = %b.id, vehicle = %b.vehicle_id, "rental completed");
            }
            metrics::counter!(crate::observability::SWEEP_COMPLETED_TOTAL)
                .increment(done.len() as u64);
            done.len()
        }
        Err(e) => {
            warn!("completion sweep failed: {e}");
            0
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<WalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

pub async fn compact_if_due(store: &WalStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            debug!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("fleetcal_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_completes_elapsed_rentals() {
        let path = test_wal_path("sweep.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());
        let clock = Arc::new(FixedClock::on(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()));
        let engine = Engine::new(store, Arc::new(NotifyHub::new()), clock.clone());

        let host = Identity::new("host");
        let renter = Identity::new("renter");
        let vid = Ulid::new();
        engine
            .create_vehicle(vid, &host, None, WeeklySchedule::default(), 0)
            .await
            .unwrap();
        let req = BookingRequest::new(
            NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 5).unwrap(),
        );
        let sub = engine.submit(&renter, vid, req).await.unwrap();
        engine.confirm(sub.booking.id, &host).await.unwrap();

        // Return day not yet passed.
        assert_eq!(sweep_once(&engine).await, 0);

        clock.advance_days(5);
        assert_eq!(sweep_once(&engine).await, 1);
        let b = engine.get_booking(sub.booking.id).await.unwrap();
        assert_eq!(b.status, BookingStatus::Completed);

        // Nothing left to do.
        assert_eq!(sweep_once(&engine).await, 0);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let path = test_wal_path("compact_threshold.wal");
        let store = WalStore::open(&path).unwrap();
        let vid = Ulid::new();
        let mut vehicle = Vehicle::new(vid, Identity::new("host"));
        vehicle.name = Some("van".into());
        crate::store::Store::create_vehicle(&store, vehicle).await.unwrap();

        assert!(!compact_if_due(&store, 10).await);
        assert!(compact_if_due(&store, 1).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
    }
}
