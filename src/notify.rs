use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, BookingStatus, CalendarDate};

const CHANNEL_CAPACITY: usize = 256;

/// Payload delivered to channel subscribers when a booking changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingNotice {
    pub booking_id: Ulid,
    pub vehicle_id: Ulid,
    pub requester: String,
    pub status: BookingStatus,
    pub start_date: CalendarDate,
    pub end_date: CalendarDate,
}

impl From<&Booking> for BookingNotice {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id,
            vehicle_id: b.vehicle_id,
            requester: b.requester.to_string(),
            status: b.status,
            start_date: b.start_date,
            end_date: b.end_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Advisory result of a dispatch. Never affects the booking itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NotifyOutcome {
    pub success: bool,
    pub channel_used: Option<String>,
}

impl NotifyOutcome {
    pub fn delivered(channel: impl Into<String>) -> Self {
        Self {
            success: true,
            channel_used: Some(channel.into()),
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

/// Outbound notification collaborator.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn notify(&self, booking: &Booking, channel_preference: Option<&str>) -> NotifyOutcome;
}

/// Named broadcast channels, created on first subscribe.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Channel every booking for a vehicle falls back to.
    pub fn vehicle_channel(vehicle_id: Ulid) -> String {
        format!("vehicle_{vehicle_id}")
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Returns how many subscribers received it; 0 if nobody listens.
    pub fn send(&self, channel: &str, payload: String) -> usize {
        let Some(sender) = self.channels.get(channel) else {
            return 0;
        };
        sender
            .send(Notification {
                channel: channel.to_string(),
                payload,
            })
            .unwrap_or(0)
    }

    pub fn remove(&self, channel: &str) {
        self.channels.remove(channel);
    }
}

#[async_trait]
impl Dispatcher for NotifyHub {
    /// Try the preferred channel first, then the vehicle channel.
    async fn notify(&self, booking: &Booking, channel_preference: Option<&str>) -> NotifyOutcome {
        let payload = match serde_json::to_string(&BookingNotice::from(booking)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(booking = %booking.id, "notice encoding failed: {e}");
                return NotifyOutcome::failed();
            }
        };
        let fallback = Self::vehicle_channel(booking.vehicle_id);
        let candidates = channel_preference
            .into_iter()
            .map(str::to_string)
            .chain(std::iter::once(fallback));
        for channel in candidates {
            if self.send(&channel, payload.clone()) > 0 {
                return NotifyOutcome::delivered(channel);
            }
        }
        NotifyOutcome::failed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use chrono::{NaiveDate, Utc};

    fn booking() -> Booking {
        Booking {
            id: Ulid::new(),
            vehicle_id: Ulid::new(),
            requester: Identity::new("renter"),
            start_date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            pickup_time: None,
            return_time: None,
            note: None,
            status: BookingStatus::Pending,
            decision_note: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_payload() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("ops");
        assert_eq!(hub.send("ops", "hello".into()), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel, "ops");
        assert_eq!(got.payload, "hello");
    }

    #[test]
    fn send_without_subscribers_reaches_nobody() {
        let hub = NotifyHub::new();
        assert_eq!(hub.send("nobody", "x".into()), 0);
    }

    #[tokio::test]
    async fn dispatch_prefers_requested_channel() {
        let hub = NotifyHub::new();
        let b = booking();
        let mut preferred = hub.subscribe("sms_maya");
        let _vehicle = hub.subscribe(&NotifyHub::vehicle_channel(b.vehicle_id));

        let outcome = hub.notify(&b, Some("sms_maya")).await;
        assert_eq!(outcome, NotifyOutcome::delivered("sms_maya"));
        let notice: BookingNotice =
            serde_json::from_str(&preferred.recv().await.unwrap().payload).unwrap();
        assert_eq!(notice.booking_id, b.id);
        assert_eq!(notice.status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_vehicle_channel() {
        let hub = NotifyHub::new();
        let b = booking();
        let channel = NotifyHub::vehicle_channel(b.vehicle_id);
        let _rx = hub.subscribe(&channel);
        let outcome = hub.notify(&b, Some("email_gone")).await;
        assert_eq!(outcome, NotifyOutcome::delivered(channel));
    }

    #[tokio::test]
    async fn dispatch_without_listeners_fails_softly() {
        let hub = NotifyHub::new();
        let outcome = hub.notify(&booking(), None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.channel_used, None);
    }
}
