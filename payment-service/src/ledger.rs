use async_trait::async_trait;
use bb8::Pool;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub const DEFAULT_CURRENCY: &str = "RUB";
pub const DEFAULT_PAGE_LIMIT: i64 = 10;

const REASON_MIN_CHARS: usize = 5;
const REASON_MAX_CHARS: usize = 500;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts unless a payment for the same booking exists. Returns whether
    /// a row was written.
    async fn insert_if_absent(&self, payment: &Payment) -> Result<bool, LedgerError>;
    async fn get(&self, id: Uuid) -> Result<Option<Payment>, LedgerError>;
    async fn get_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, LedgerError>;
    /// Newest first, together with the user's total payment count.
    async fn list_for_user(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<(Vec<Payment>, i64), LedgerError>;
    async fn refunds_for(&self, payment_id: Uuid) -> Result<Vec<Refund>, LedgerError>;
    /// Completes a pending payment under a row lock.
    async fn confirm(&self, id: Uuid, now: DateTime<Utc>) -> Result<Payment, LedgerError>;
    /// Writes the refund row and the payment's new totals atomically, with
    /// the payment row locked for the duration.
    async fn record_refund(
        &self,
        payment_id: Uuid,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Payment, Refund), LedgerError>;
}

pub struct PgPaymentStore {
    pool: DbPool,
}

impl PgPaymentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(
        &self,
    ) -> Result<bb8::PooledConnection<'_, AsyncDieselConnectionManager<AsyncPgConnection>>, LedgerError> {
        self.pool
            .get()
            .await
            .map_err(|e| LedgerError::Storage(anyhow::anyhow!("database pool: {}", e)))
    }
}

async fn lock_payment(conn: &mut AsyncPgConnection, id: Uuid) -> Result<Payment, LedgerError> {
    let row = payments::table
        .find(id)
        .select(DbPayment::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or(LedgerError::NotFound(id))?;
    Ok(Payment::try_from(row)?)
}

#[async_trait]
impl PaymentStore for PgPaymentStore {
    async fn insert_if_absent(&self, payment: &Payment) -> Result<bool, LedgerError> {
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(payments::table)
            .values(NewPayment::from(payment))
            .on_conflict(payments::booking_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;
        Ok(inserted > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Payment>, LedgerError> {
        let mut conn = self.conn().await?;
        let row = payments::table
            .find(id)
            .select(DbPayment::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Payment::try_from).transpose()?)
    }

    async fn get_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, LedgerError> {
        let mut conn = self.conn().await?;
        let row = payments::table
            .filter(payments::booking_id.eq(booking_id))
            .select(DbPayment::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(row.map(Payment::try_from).transpose()?)
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<(Vec<Payment>, i64), LedgerError> {
        let mut conn = self.conn().await?;
        let total: i64 = payments::table
            .filter(payments::user_id.eq(user_id))
            .count()
            .get_result(&mut conn)
            .await?;
        let rows = payments::table
            .filter(payments::user_id.eq(user_id))
            .order(payments::created_at.desc())
            .limit(limit)
            .offset(offset)
            .select(DbPayment::as_select())
            .load(&mut conn)
            .await?;

        let payments = rows
            .into_iter()
            .map(Payment::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok((payments, total))
    }

    async fn refunds_for(&self, payment_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        let mut conn = self.conn().await?;
        let rows = refunds::table
            .filter(refunds::payment_id.eq(payment_id))
            .order(refunds::created_at.asc())
            .select(DbRefund::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(Refund::try_from)
            .collect::<anyhow::Result<Vec<_>>>()?)
    }

    async fn confirm(&self, id: Uuid, now: DateTime<Utc>) -> Result<Payment, LedgerError> {
        let mut conn = self.conn().await?;
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let mut payment = lock_payment(conn, id).await?;
                if payment.confirm(now)? {
                    diesel::update(payments::table.find(id))
                        .set(NewPayment::from(&payment))
                        .execute(conn)
                        .await?;
                }
                Ok(payment)
            })
        })
        .await
    }

    async fn record_refund(
        &self,
        payment_id: Uuid,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Payment, Refund), LedgerError> {
        let mut conn = self.conn().await?;
        let reason = reason.to_string();
        conn.transaction::<_, LedgerError, _>(|conn| {
            Box::pin(async move {
                let mut payment = lock_payment(conn, payment_id).await?;
                payment.apply_refund(amount, now)?;

                let refund = Refund {
                    id: Uuid::new_v4(),
                    payment_id,
                    amount,
                    reason,
                    status: RefundStatus::Completed,
                    created_at: now,
                    updated_at: now,
                };
                diesel::insert_into(refunds::table)
                    .values(NewRefund::from(&refund))
                    .execute(conn)
                    .await?;
                diesel::update(payments::table.find(payment_id))
                    .set(NewPayment::from(&payment))
                    .execute(conn)
                    .await?;

                Ok((payment, refund))
            })
        })
        .await
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatePayment {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub method: String,
}

#[derive(Debug)]
pub enum PendingOutcome {
    Created(Payment),
    AlreadyExists(Payment),
}

impl PendingOutcome {
    pub fn payment(&self) -> &Payment {
        match self {
            PendingOutcome::Created(p) | PendingOutcome::AlreadyExists(p) => p,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentPage {
    pub payments: Vec<Payment>,
    pub total: i64,
    pub count: usize,
}

pub struct Ledger {
    store: Arc<dyn PaymentStore>,
    default_currency: String,
}

impl Ledger {
    pub fn new(store: Arc<dyn PaymentStore>, default_currency: impl Into<String>) -> Self {
        Self {
            store,
            default_currency: default_currency.into(),
        }
    }

    fn build(&self, req: CreatePayment, status: PaymentStatus, now: DateTime<Utc>) -> Result<Payment, LedgerError> {
        if req.booking_id.is_nil() {
            return Err(LedgerError::Validation("booking ID must be provided".into()));
        }
        if req.user_id.is_nil() {
            return Err(LedgerError::Validation("user ID must be provided".into()));
        }
        if req.amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let method: PaymentMethod = req.method.trim().to_ascii_lowercase().parse()?;
        let currency = req
            .currency
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.default_currency.clone());
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(LedgerError::Validation(format!(
                "currency must be a three-letter code, got {currency:?}"
            )));
        }

        let id = Uuid::new_v4();
        Ok(Payment {
            id,
            booking_id: req.booking_id,
            user_id: req.user_id,
            amount: req.amount,
            currency,
            method,
            status,
            transaction_id: format!("txn_{}", id.simple()),
            refunded_amount: 0,
            paid_at: (status == PaymentStatus::Completed).then_some(now),
            refunded_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Creates a payment in `status`; a completed payment is stamped as paid.
    pub async fn create_payment(
        &self,
        req: CreatePayment,
        status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> Result<Payment, LedgerError> {
        let payment = self.build(req, status, now)?;
        if !self.store.insert_if_absent(&payment).await? {
            return Err(LedgerError::AlreadyExists(payment.booking_id));
        }
        info!(payment_id = %payment.id, booking_id = %payment.booking_id, status = %payment.status, "payment created");
        Ok(payment)
    }

    /// Idempotent on the booking id: a redelivered creation yields the
    /// payment that is already there.
    pub async fn create_pending_for_booking(
        &self,
        req: CreatePayment,
        now: DateTime<Utc>,
    ) -> Result<PendingOutcome, LedgerError> {
        let payment = self.build(req, PaymentStatus::Pending, now)?;
        if self.store.insert_if_absent(&payment).await? {
            info!(payment_id = %payment.id, booking_id = %payment.booking_id, "pending payment created");
            return Ok(PendingOutcome::Created(payment));
        }

        let existing = self
            .store
            .get_by_booking(payment.booking_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("payment for booking {} vanished after conflict", payment.booking_id))?;
        info!(payment_id = %existing.id, booking_id = %existing.booking_id, "payment already exists, skipping");
        Ok(PendingOutcome::AlreadyExists(existing))
    }

    pub async fn confirm(&self, payment_id: Uuid, now: DateTime<Utc>) -> Result<Payment, LedgerError> {
        let payment = self.store.confirm(payment_id, now).await?;
        info!(payment_id = %payment.id, "payment confirmed");
        Ok(payment)
    }

    pub async fn refund(
        &self,
        payment_id: Uuid,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Refund, LedgerError> {
        let reason = reason.trim();
        let chars = reason.chars().count();
        if !(REASON_MIN_CHARS..=REASON_MAX_CHARS).contains(&chars) {
            return Err(LedgerError::Validation(format!(
                "refund reason must be {REASON_MIN_CHARS}-{REASON_MAX_CHARS} characters"
            )));
        }
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }

        match self.store.record_refund(payment_id, amount, reason, now).await {
            Ok((payment, refund)) => {
                info!(
                    refund_id = %refund.id,
                    payment_id = %payment.id,
                    amount,
                    refunded_amount = payment.refunded_amount,
                    status = %payment.status,
                    "refund recorded"
                );
                Ok(refund)
            }
            Err(e) => {
                warn!(%payment_id, amount, error = %e, "refund rejected");
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Payment, LedgerError> {
        self.store.get(id).await?.ok_or(LedgerError::NotFound(id))
    }

    pub async fn get_by_booking(&self, booking_id: Uuid) -> Result<Payment, LedgerError> {
        self.store
            .get_by_booking(booking_id)
            .await?
            .ok_or(LedgerError::BookingNotFound(booking_id))
    }

    /// Like [`Ledger::get_by_booking`] but absence is not an error.
    pub async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, LedgerError> {
        self.store.get_by_booking(booking_id).await
    }

    pub async fn history(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<PaymentPage, LedgerError> {
        if limit <= 0 || offset < 0 {
            return Err(LedgerError::Validation("limit must be positive and offset non-negative".into()));
        }
        let (payments, total) = self.store.list_for_user(user_id, limit, offset).await?;
        Ok(PaymentPage {
            count: payments.len(),
            payments,
            total,
        })
    }

    pub async fn refunds(&self, payment_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        self.get(payment_id).await?;
        self.store.refunds_for(payment_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryPaymentStore;

    fn ledger() -> (Ledger, Arc<InMemoryPaymentStore>) {
        let store = Arc::new(InMemoryPaymentStore::default());
        (Ledger::new(store.clone(), DEFAULT_CURRENCY), store)
    }

    fn request(amount: i64) -> CreatePayment {
        CreatePayment {
            booking_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount,
            currency: None,
            method: "card".into(),
        }
    }

    #[tokio::test]
    async fn completed_payment_is_stamped_and_defaulted() {
        let (ledger, _) = ledger();
        let payment = ledger
            .create_payment(request(5000), PaymentStatus::Completed, Utc::now())
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert!(payment.paid_at.is_some());
        assert_eq!(payment.currency, "RUB");
        assert!(payment.transaction_id.starts_with("txn_"));
        assert_eq!(ledger.get(payment.id).await.unwrap(), payment);
    }

    #[tokio::test]
    async fn create_validates_amount_and_method() {
        let (ledger, store) = ledger();
        let err = ledger
            .create_payment(request(0), PaymentStatus::Completed, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount));

        let mut req = request(100);
        req.method = "barter".into();
        let err = ledger
            .create_payment(req, PaymentStatus::Completed, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMethod(_)));
        assert!(store.payments().is_empty());
    }

    #[tokio::test]
    async fn currency_must_be_a_three_letter_code() {
        let (ledger, store) = ledger();
        for bad in ["US DOLLARS", "EU", "U$D"] {
            let mut req = request(100);
            req.currency = Some(bad.into());
            let err = ledger
                .create_payment(req, PaymentStatus::Completed, Utc::now())
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::Validation(_)), "{bad}: {err:?}");
        }
        assert!(store.payments().is_empty());

        let mut req = request(100);
        req.currency = Some(" usd ".into());
        let payment = ledger
            .create_payment(req, PaymentStatus::Completed, Utc::now())
            .await
            .unwrap();
        assert_eq!(payment.currency, "USD");
    }

    #[tokio::test]
    async fn second_payment_for_booking_is_rejected() {
        let (ledger, _) = ledger();
        let req = request(100);
        ledger
            .create_payment(req.clone(), PaymentStatus::Completed, Utc::now())
            .await
            .unwrap();
        let err = ledger
            .create_payment(req, PaymentStatus::Completed, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn pending_creation_is_idempotent() {
        let (ledger, store) = ledger();
        let req = request(5000);
        let first = ledger.create_pending_for_booking(req.clone(), Utc::now()).await.unwrap();
        let second = ledger.create_pending_for_booking(req, Utc::now()).await.unwrap();

        assert!(matches!(first, PendingOutcome::Created(_)));
        match second {
            PendingOutcome::AlreadyExists(p) => assert_eq!(p.id, first.payment().id),
            other => panic!("expected existing payment, got {other:?}"),
        }
        assert_eq!(store.payments().len(), 1);
        assert!(first.payment().paid_at.is_none());
    }

    #[tokio::test]
    async fn refunds_accumulate_until_fully_refunded() {
        let (ledger, store) = ledger();
        let payment = ledger
            .create_payment(request(5000), PaymentStatus::Completed, Utc::now())
            .await
            .unwrap();

        ledger.refund(payment.id, 1500, "partial return", Utc::now()).await.unwrap();
        assert_eq!(ledger.get(payment.id).await.unwrap().refunded_amount, 1500);

        let err = ledger
            .refund(payment.id, 4000, "too much money", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::RefundExceedsRemaining { requested: 4000, available: 3500 }
        ));

        ledger.refund(payment.id, 3500, "rest of it", Utc::now()).await.unwrap();
        let after = ledger.get(payment.id).await.unwrap();
        assert_eq!(after.refunded_amount, 5000);
        assert_eq!(after.status, PaymentStatus::Refunded);
        assert_eq!(store.refunds().len(), 2);
        assert_eq!(ledger.refunds(payment.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pending_payment_cannot_be_refunded_until_confirmed() {
        let (ledger, store) = ledger();
        let payment = ledger
            .create_pending_for_booking(request(800), Utc::now())
            .await
            .unwrap()
            .payment()
            .clone();

        let err = ledger.refund(payment.id, 800, "changed mind", Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotCompleted(PaymentStatus::Pending)));
        assert!(store.refunds().is_empty());

        let confirmed = ledger.confirm(payment.id, Utc::now()).await.unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Completed);
        assert!(confirmed.paid_at.is_some());
        let again = ledger.confirm(payment.id, Utc::now()).await.unwrap();
        assert_eq!(again.paid_at, confirmed.paid_at);

        ledger.refund(payment.id, 800, "changed mind", Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn refund_reason_is_validated() {
        let (ledger, _) = ledger();
        let payment = ledger
            .create_payment(request(100), PaymentStatus::Completed, Utc::now())
            .await
            .unwrap();
        let err = ledger.refund(payment.id, 10, "no", Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[tokio::test]
    async fn history_is_paginated() {
        let (ledger, _) = ledger();
        let user = Uuid::new_v4();
        for _ in 0..3 {
            let mut req = request(100);
            req.user_id = user;
            ledger
                .create_payment(req, PaymentStatus::Completed, Utc::now())
                .await
                .unwrap();
        }
        ledger
            .create_payment(request(100), PaymentStatus::Completed, Utc::now())
            .await
            .unwrap();

        let page = ledger.history(user, 2, 0).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.count, 2);

        let page = ledger.history(user, 2, 2).await.unwrap();
        assert_eq!(page.count, 1);

        assert!(ledger.history(user, 0, 0).await.is_err());
    }

    #[tokio::test]
    async fn missing_payment_lookups() {
        let (ledger, _) = ledger();
        let id = Uuid::new_v4();
        assert!(matches!(ledger.get(id).await, Err(LedgerError::NotFound(_))));
        assert!(matches!(ledger.get_by_booking(id).await, Err(LedgerError::BookingNotFound(_))));
        assert!(ledger.find_by_booking(id).await.unwrap().is_none());
        assert!(matches!(
            ledger.refund(id, 10, "nothing to refund", Utc::now()).await,
            Err(LedgerError::NotFound(_))
        ));
    }
}
