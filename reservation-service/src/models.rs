use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::BookingStatus;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Booking {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub client_id: Uuid,
    pub owner_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub price_cents: i64,
    pub status: BookingStatus,
    pub reason_for_cancel: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn duration_minutes(&self) -> i64 {
        (self.end_at - self.start_at).num_minutes()
    }

    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }

    /// Half-open interval intersection: touching bookings do not overlap.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start_at < end && self.end_at > start
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::bookings)]
pub struct DbBooking {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub client_id: Uuid,
    pub owner_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub price_cents: i64,
    pub status: String,
    pub reason_for_cancel: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::bookings)]
#[diesel(treat_none_as_null = true)]
pub struct NewBooking {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub client_id: Uuid,
    pub owner_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub price_cents: i64,
    pub status: String,
    pub reason_for_cancel: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Booking> for NewBooking {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id,
            venue_id: booking.venue_id,
            client_id: booking.client_id,
            owner_id: booking.owner_id,
            start_at: booking.start_at,
            end_at: booking.end_at,
            price_cents: booking.price_cents,
            status: booking.status.as_str().to_string(),
            reason_for_cancel: booking.reason_for_cancel.clone(),
            created_at: booking.created_at,
            updated_at: booking.updated_at,
        }
    }
}

impl TryFrom<DbBooking> for Booking {
    type Error = anyhow::Error;

    fn try_from(row: DbBooking) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            venue_id: row.venue_id,
            client_id: row.client_id,
            owner_id: row.owner_id,
            start_at: row.start_at,
            end_at: row.end_at,
            price_cents: row.price_cents,
            status: row.status.parse()?,
            reason_for_cancel: row.reason_for_cancel,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
