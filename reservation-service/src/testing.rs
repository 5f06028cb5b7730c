//! In-memory stand-ins for the store, the venue service and the broker.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use shared::schedule::WeeklySchedule;
use shared::{BookingCancelled, BookingCreated, BookingStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::Booking;
use crate::publisher::{EventPublisher, PublishError};
use crate::store::{BookingStore, StoreError};
use crate::venue::{ScheduleError, ScheduleSource};

pub fn monday() -> NaiveDate {
    let day = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
    assert_eq!(day.weekday(), Weekday::Mon);
    day
}

pub fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub fn booking_at(venue_id: Uuid, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Booking {
    Booking {
        id: Uuid::new_v4(),
        venue_id,
        client_id: Uuid::new_v4(),
        owner_id: Uuid::new_v4(),
        start_at,
        end_at,
        price_cents: 5000,
        status: BookingStatus::Pending,
        reason_for_cancel: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Enforces the same non-overlap rule as the database constraint.
#[derive(Default)]
pub struct InMemoryBookingStore {
    rows: Mutex<Vec<Booking>>,
}

impl InMemoryBookingStore {
    pub fn seed(&self, booking: Booking) {
        self.rows.lock().unwrap().push(booking);
    }

    pub fn all(&self) -> Vec<Booking> {
        self.rows.lock().unwrap().clone()
    }

    fn collides(rows: &[Booking], candidate: &Booking) -> bool {
        candidate.is_active()
            && rows.iter().any(|b| {
                b.id != candidate.id
                    && b.venue_id == candidate.venue_id
                    && b.is_active()
                    && b.overlaps(candidate.start_at, candidate.end_at)
            })
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if Self::collides(&rows, booking) {
            return Err(StoreError::Overlap);
        }
        rows.push(booking.clone());
        Ok(())
    }

    async fn save(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if Self::collides(&rows, booking) {
            return Err(StoreError::Overlap);
        }
        match rows.iter_mut().find(|b| b.id == booking.id) {
            Some(row) => {
                *row = booking.clone();
                Ok(())
            }
            None => Err(StoreError::Other(anyhow::anyhow!("booking {} missing", booking.id))),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.rows.lock().unwrap().iter().find(|b| b.id == id).cloned())
    }

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn list_active_in_range(
        &self,
        venue_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Booking>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.venue_id == venue_id && b.is_active() && b.overlaps(from, to))
            .cloned()
            .collect())
    }
}

pub enum StaticSchedule {
    Open(WeeklySchedule),
    Unavailable,
    NotFound,
}

impl StaticSchedule {
    pub fn ok(schedule: WeeklySchedule) -> Self {
        Self::Open(schedule)
    }

    pub fn unavailable() -> Self {
        Self::Unavailable
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

#[async_trait]
impl ScheduleSource for StaticSchedule {
    async fn weekly_schedule(&self, venue_id: Uuid) -> Result<WeeklySchedule, ScheduleError> {
        match self {
            Self::Open(schedule) => Ok(schedule.clone()),
            Self::Unavailable => Err(ScheduleError::Unavailable("timeout".into())),
            Self::NotFound => Err(ScheduleError::VenueNotFound(venue_id)),
        }
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub created: Mutex<Vec<BookingCreated>>,
    pub cancelled: Mutex<Vec<BookingCancelled>>,
    failing: AtomicBool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.failing.store(true, Ordering::SeqCst);
        publisher
    }

    fn check(&self, topic: &str) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Delivery {
                topic: topic.to_string(),
                reason: "broker down".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_created(&self, event: &BookingCreated) -> Result<(), PublishError> {
        self.check(shared::TOPIC_BOOKING_CREATED)?;
        self.created.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn publish_cancelled(&self, event: &BookingCancelled) -> Result<(), PublishError> {
        self.check(shared::TOPIC_BOOKING_CANCELLED)?;
        self.cancelled.lock().unwrap().push(event.clone());
        Ok(())
    }
}
