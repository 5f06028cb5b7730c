use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::PaymentStore;
use crate::models::{Payment, Refund, RefundStatus};
use crate::settlement::{DeadLetter, DeadLetterSink};

/// Mirrors the unique booking id constraint and the locked refund path.
#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: Mutex<Vec<Payment>>,
    refunds: Mutex<Vec<Refund>>,
    outage: AtomicU32,
}

impl InMemoryPaymentStore {
    pub fn payments(&self) -> Vec<Payment> {
        self.payments.lock().unwrap().clone()
    }

    pub fn refunds(&self) -> Vec<Refund> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn seed(&self, payment: Payment) {
        self.payments.lock().unwrap().push(payment);
    }

    /// The next `calls` storage calls fail.
    pub fn fail_next(&self, calls: u32) {
        self.outage.store(calls, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), LedgerError> {
        let failing = self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LedgerError::Storage(anyhow::anyhow!("connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert_if_absent(&self, payment: &Payment) -> Result<bool, LedgerError> {
        self.check()?;
        let mut payments = self.payments.lock().unwrap();
        if payments.iter().any(|p| p.booking_id == payment.booking_id) {
            return Ok(false);
        }
        payments.push(payment.clone());
        Ok(true)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Payment>, LedgerError> {
        self.check()?;
        Ok(self.payments.lock().unwrap().iter().find(|p| p.id == id).cloned())
    }

    async fn get_by_booking(&self, booking_id: Uuid) -> Result<Option<Payment>, LedgerError> {
        self.check()?;
        Ok(self
            .payments
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.booking_id == booking_id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64, offset: i64) -> Result<(Vec<Payment>, i64), LedgerError> {
        self.check()?;
        let mut mine: Vec<Payment> = self
            .payments
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        mine.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = mine.len() as i64;
        let page = mine.into_iter().skip(offset as usize).take(limit as usize).collect();
        Ok((page, total))
    }

    async fn refunds_for(&self, payment_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        self.check()?;
        Ok(self
            .refunds
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn confirm(&self, id: Uuid, now: DateTime<Utc>) -> Result<Payment, LedgerError> {
        self.check()?;
        let mut payments = self.payments.lock().unwrap();
        let payment = payments
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        payment.confirm(now)?;
        Ok(payment.clone())
    }

    async fn record_refund(
        &self,
        payment_id: Uuid,
        amount: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(Payment, Refund), LedgerError> {
        self.check()?;
        let mut payments = self.payments.lock().unwrap();
        let payment = payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or(LedgerError::NotFound(payment_id))?;

        let mut updated = payment.clone();
        updated.apply_refund(amount, now)?;
        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id,
            amount,
            reason: reason.to_string(),
            status: RefundStatus::Completed,
            created_at: now,
            updated_at: now,
        };
        self.refunds.lock().unwrap().push(refund.clone());
        *payment = updated.clone();
        Ok((updated, refund))
    }
}

#[derive(Default)]
pub struct RecordingDeadLetters {
    pub parked: Mutex<Vec<DeadLetter>>,
    outage: AtomicU32,
}

impl RecordingDeadLetters {
    /// The next `writes` parks fail.
    pub fn fail_next(&self, writes: u32) {
        self.outage.store(writes, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetters {
    async fn park(&self, letter: DeadLetter) -> anyhow::Result<()> {
        if self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("connection refused");
        }
        self.parked.lock().unwrap().push(letter);
        Ok(())
    }
}
