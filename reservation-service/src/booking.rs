use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use shared::{BookingCancelled, BookingCreated, BookingStatus};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::availability::{AvailabilityEngine, AvailabilityError, Rejection, Slot};
use crate::models::Booking;
use crate::publisher::{EventPublisher, PublishError};
use crate::store::{BookingStore, StoreError};
use crate::venue::ScheduleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Owner,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Caller identity as forwarded by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    fn may_modify(&self, booking: &Booking) -> bool {
        self.role == Role::Admin || self.user_id == booking.client_id || self.user_id == booking.owner_id
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBooking {
    pub venue_id: Uuid,
    pub owner_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub price_cents: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBooking {
    pub venue_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub owner_id: Option<Uuid>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub price_cents: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),
    #[error("booking {0} not found")]
    NotFound(Uuid),
    #[error("only clients and administrators can create bookings")]
    RoleNotAllowed,
    #[error("not allowed to modify booking {0}")]
    Forbidden(Uuid),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("only pending bookings can be updated, current status: {0}")]
    NotPending(BookingStatus),
    #[error("booking is {0} and cannot be cancelled")]
    CannotCancel(BookingStatus),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Storage(anyhow::Error),
}

impl From<StoreError> for BookingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Overlap => BookingError::Rejected(Rejection::Conflict { with: None }),
            StoreError::Other(e) => BookingError::Storage(e),
        }
    }
}

impl From<AvailabilityError> for BookingError {
    fn from(err: AvailabilityError) -> Self {
        match err {
            AvailabilityError::Rejected(r) => r.into(),
            AvailabilityError::Schedule(e) => e.into(),
            AvailabilityError::Storage(e) => e.into(),
        }
    }
}

/// Outcome of a state change that also emits a lifecycle event. The state
/// change is committed either way; `Degraded` means the event may be lost.
#[derive(Debug)]
pub enum Published<T> {
    Delivered(T),
    Degraded { value: T, warning: String },
}

impl<T> Published<T> {
    pub fn value(&self) -> &T {
        match self {
            Published::Delivered(value) | Published::Degraded { value, .. } => value,
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            Published::Delivered(_) => None,
            Published::Degraded { warning, .. } => Some(warning),
        }
    }

    pub fn into_parts(self) -> (T, Option<String>) {
        match self {
            Published::Delivered(value) => (value, None),
            Published::Degraded { value, warning } => (value, Some(warning)),
        }
    }
}

fn require(condition: bool, message: &str) -> Result<(), BookingError> {
    if condition {
        Ok(())
    } else {
        Err(BookingError::Validation(message.to_string()))
    }
}

pub struct BookingService {
    store: Arc<dyn BookingStore>,
    engine: AvailabilityEngine,
    publisher: Arc<dyn EventPublisher>,
}

impl BookingService {
    pub fn new(store: Arc<dyn BookingStore>, engine: AvailabilityEngine, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, engine, publisher }
    }

    pub async fn get(&self, id: Uuid) -> Result<Booking, BookingError> {
        self.store.get(id).await?.ok_or(BookingError::NotFound(id))
    }

    pub async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, BookingError> {
        Ok(self.store.list_for_client(client_id).await?)
    }

    pub async fn availability(&self, venue_id: Uuid, date: NaiveDate) -> Result<Vec<Slot>, BookingError> {
        Ok(self.engine.available_slots(venue_id, date).await?)
    }

    pub async fn create(
        &self,
        actor: &Actor,
        request: CreateBooking,
        now: DateTime<Utc>,
    ) -> Result<Published<Booking>, BookingError> {
        require(!request.venue_id.is_nil(), "venue ID must be provided")?;
        require(!request.owner_id.is_nil(), "owner ID must be provided")?;
        require(request.start_at < request.end_at, "start time must be before end time")?;
        require(request.start_at >= now, "start time cannot be in the past")?;
        require(request.price_cents > 0, "price must be greater than zero")?;
        if !matches!(actor.role, Role::Client | Role::Admin) {
            return Err(BookingError::RoleNotAllowed);
        }

        self.engine
            .check_candidate(request.venue_id, request.start_at, request.end_at, None)
            .await?;

        let booking = Booking {
            id: Uuid::new_v4(),
            venue_id: request.venue_id,
            client_id: actor.user_id,
            owner_id: request.owner_id,
            start_at: request.start_at,
            end_at: request.end_at,
            price_cents: request.price_cents,
            status: BookingStatus::Pending,
            reason_for_cancel: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&booking).await?;
        info!(booking_id = %booking.id, venue_id = %booking.venue_id, client_id = %booking.client_id, "booking created");

        let event = BookingCreated {
            event_id: Uuid::new_v4(),
            created_at: Utc::now(),
            booking_id: booking.id,
            venue_id: booking.venue_id,
            client_id: booking.client_id,
            owner_id: booking.owner_id,
            start_at: booking.start_at,
            end_at: booking.end_at,
            price: booking.price_cents,
            status: booking.status,
            payment_method: None,
        };
        let result = self.publisher.publish_created(&event).await;
        Ok(announce(booking, result))
    }

    pub async fn update(
        &self,
        actor: &Actor,
        id: Uuid,
        changes: UpdateBooking,
        now: DateTime<Utc>,
    ) -> Result<Booking, BookingError> {
        let mut booking = self.get(id).await?;
        if !actor.may_modify(&booking) {
            return Err(BookingError::Forbidden(id));
        }
        if booking.status != BookingStatus::Pending {
            return Err(BookingError::NotPending(booking.status));
        }

        require(!changes.venue_id.is_some_and(|v| v.is_nil()), "venue ID must not be empty")?;
        require(!changes.client_id.is_some_and(|v| v.is_nil()), "client ID must not be empty")?;
        require(!changes.owner_id.is_some_and(|v| v.is_nil()), "owner ID must not be empty")?;
        require(!changes.price_cents.is_some_and(|p| p <= 0), "price must be greater than zero")?;

        let start_at = changes.start_at.unwrap_or(booking.start_at);
        let end_at = changes.end_at.unwrap_or(booking.end_at);
        require(start_at < end_at, "start time must be before end time")?;
        require(start_at >= now, "start time cannot be in the past")?;

        let venue_id = changes.venue_id.unwrap_or(booking.venue_id);
        self.engine.check_candidate(venue_id, start_at, end_at, Some(booking.id)).await?;

        booking.venue_id = venue_id;
        booking.client_id = changes.client_id.unwrap_or(booking.client_id);
        booking.owner_id = changes.owner_id.unwrap_or(booking.owner_id);
        booking.start_at = start_at;
        booking.end_at = end_at;
        booking.price_cents = changes.price_cents.unwrap_or(booking.price_cents);
        booking.updated_at = now;

        self.store.save(&booking).await?;
        info!(booking_id = %booking.id, "booking updated");
        Ok(booking)
    }

    pub async fn cancel(
        &self,
        actor: &Actor,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Published<Booking>, BookingError> {
        let reason = reason.trim();
        require(!reason.is_empty(), "cancellation reason must be provided")?;

        let mut booking = self.get(id).await?;
        if !actor.may_modify(&booking) {
            return Err(BookingError::Forbidden(id));
        }
        if !booking.status.can_transition_to(BookingStatus::Cancelled) {
            return Err(BookingError::CannotCancel(booking.status));
        }

        booking.status = BookingStatus::Cancelled;
        booking.reason_for_cancel = Some(reason.to_string());
        booking.updated_at = now;
        self.store.save(&booking).await?;
        info!(booking_id = %booking.id, reason, "booking cancelled");

        let event = BookingCancelled {
            event_id: Uuid::new_v4(),
            created_at: Utc::now(),
            booking_id: booking.id,
            reason: reason.to_string(),
            status: booking.status,
        };
        let result = self.publisher.publish_cancelled(&event).await;
        Ok(announce(booking, result))
    }
}

fn announce(booking: Booking, result: Result<(), PublishError>) -> Published<Booking> {
    match result {
        Ok(()) => Published::Delivered(booking),
        Err(e) => {
            warn!(booking_id = %booking.id, error = %e, "state saved but lifecycle event was not published");
            Published::Degraded {
                warning: format!("booking {} saved but the event could not be published: {}", booking.id, e),
                value: booking,
            }
        }
    }
}
