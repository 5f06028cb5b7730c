use async_trait::async_trait;
use bb8::Pool;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::BookingStatus;
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

/// Name of the exclusion constraint that rejects overlapping active bookings.
pub const OVERLAP_CONSTRAINT: &str = "bookings_no_overlap";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("booking overlaps an existing booking on this venue")]
    Overlap,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError>;
    async fn save(&self, booking: &Booking) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;
    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError>;
    /// Non-cancelled bookings on `venue_id` intersecting `[from, to)`.
    async fn list_active_in_range(
        &self,
        venue_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Booking>, StoreError>;
}

pub struct PgBookingStore {
    pool: DbPool,
}

impl PgBookingStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, AsyncDieselConnectionManager<AsyncPgConnection>>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Other(anyhow::anyhow!("database pool: {}", e)))
    }
}

fn map_write_error(err: DieselError) -> StoreError {
    match &err {
        DieselError::DatabaseError(_, info) if info.constraint_name() == Some(OVERLAP_CONSTRAINT) => {
            StoreError::Overlap
        }
        _ => StoreError::Other(err.into()),
    }
}

fn to_bookings(rows: Vec<DbBooking>) -> Result<Vec<Booking>, StoreError> {
    rows.into_iter()
        .map(|row| Booking::try_from(row).map_err(StoreError::Other))
        .collect()
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn insert(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(bookings::table)
            .values(NewBooking::from(booking))
            .execute(&mut conn)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn save(&self, booking: &Booking) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(bookings::table.find(booking.id))
            .set(NewBooking::from(booking))
            .execute(&mut conn)
            .await
            .map_err(map_write_error)?;

        if updated == 0 {
            return Err(StoreError::Other(anyhow::anyhow!("booking {} vanished during update", booking.id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let row = bookings::table
            .find(id)
            .select(DbBooking::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(|e| StoreError::Other(e.into()))?;

        row.map(Booking::try_from).transpose().map_err(StoreError::Other)
    }

    async fn list_for_client(&self, client_id: Uuid) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(bookings::client_id.eq(client_id))
            .order(bookings::start_at.desc())
            .select(DbBooking::as_select())
            .load(&mut conn)
            .await
            .map_err(|e| StoreError::Other(e.into()))?;

        to_bookings(rows)
    }

    async fn list_active_in_range(
        &self,
        venue_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Booking>, StoreError> {
        let mut conn = self.conn().await?;
        let rows = bookings::table
            .filter(bookings::venue_id.eq(venue_id))
            .filter(bookings::status.ne(BookingStatus::Cancelled.as_str()))
            .filter(bookings::start_at.lt(to))
            .filter(bookings::end_at.gt(from))
            .order(bookings::start_at.asc())
            .select(DbBooking::as_select())
            .load(&mut conn)
            .await
            .map_err(|e| StoreError::Other(e.into()))?;

        to_bookings(rows)
    }
}
