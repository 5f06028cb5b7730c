//! Reacts to booking lifecycle events: a created booking gets a pending
//! payment, a cancelled booking gets its completed payment refunded.
//!
//! Delivery is at-least-once. Offsets are committed only once a message has
//! reached a final outcome, which includes being parked as a dead letter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel_async::RunQueryDsl;
use futures::StreamExt;
use rand::Rng;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use serde::de::DeserializeOwned;
use shared::{BookingCancelled, BookingCreated};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::{CreatePayment, DbPool, Ledger, PendingOutcome};
use crate::models::{NewDeadLetter, PaymentStatus};
use crate::schema::dead_letters;

pub const CANCELLATION_REFUND_REASON: &str = "booking cancelled";

/// Jittered exponential backoff between attempts of one message.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

/// Upper bound on any single backoff.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        let base_delay = base_delay.clamp(Duration::from_millis(1), MAX_RETRY_DELAY);
        Self {
            max_attempts: max_attempts.max(1),
            max_delay: max_delay.clamp(base_delay, MAX_RETRY_DELAY),
            base_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2_u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(200), Duration::from_secs(10), 0.2)
    }
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub brokers: String,
    pub group_id: String,
    pub created_topic: String,
    pub cancelled_topic: String,
    pub retry: RetryPolicy,
}

impl SettlementConfig {
    pub fn consumer(&self, topic: &str) -> anyhow::Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &self.group_id)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(consumer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Cancelled,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "booking.created",
            EventKind::Cancelled => "booking.cancelled",
        }
    }
}

/// A message copied out of the consumer buffer.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl Inbound {
    pub fn from_message<M: Message>(message: &M) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub error: String,
    pub attempts: u32,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn park(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

pub struct PgDeadLetterSink {
    pool: DbPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn park(&self, letter: DeadLetter) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await.map_err(|e| anyhow::anyhow!("database pool: {}", e))?;
        let row = NewDeadLetter {
            id: Uuid::new_v4(),
            topic: letter.topic,
            kafka_partition: letter.partition,
            kafka_offset: letter.offset,
            message_key: letter.key,
            payload: letter.payload,
            error: letter.error,
            attempts: i32::try_from(letter.attempts)?,
            created_at: Utc::now(),
        };
        diesel::insert_into(dead_letters::table)
            .values(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
pub enum Settled {
    PaymentCreated(Uuid),
    PaymentExists(Uuid),
    Refunded { payment_id: Uuid, amount: i64 },
    Skipped(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Transient(LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Done,
    DeadLettered,
    /// Shutdown arrived before the message was settled or parked; the
    /// offset must not be committed.
    Interrupted,
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, HandleError> {
    serde_json::from_slice(payload).map_err(|e| HandleError::Malformed(e.to_string()))
}

pub struct Settlement {
    ledger: Arc<Ledger>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
}

impl Settlement {
    pub fn new(ledger: Arc<Ledger>, dead_letters: Arc<dyn DeadLetterSink>, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            dead_letters,
            retry,
        }
    }

    pub async fn handle_created(&self, payload: &[u8], now: DateTime<Utc>) -> Result<Settled, HandleError> {
        let event: BookingCreated = decode(payload)?;
        if event.booking_id.is_nil() || event.client_id.is_nil() {
            return Err(HandleError::Malformed("booking and client ids must be set".into()));
        }
        if event.price <= 0 {
            return Err(HandleError::Malformed(format!("non-positive price {}", event.price)));
        }

        let request = CreatePayment {
            booking_id: event.booking_id,
            user_id: event.client_id,
            amount: event.price,
            currency: None,
            method: event.payment_method.unwrap_or_else(|| "card".to_string()),
        };
        match self.ledger.create_pending_for_booking(request, now).await {
            Ok(PendingOutcome::Created(p)) => Ok(Settled::PaymentCreated(p.id)),
            Ok(PendingOutcome::AlreadyExists(p)) => Ok(Settled::PaymentExists(p.id)),
            Err(e) if e.is_permanent() => Err(HandleError::Malformed(e.to_string())),
            Err(e) => Err(HandleError::Transient(e)),
        }
    }

    pub async fn handle_cancelled(&self, payload: &[u8], now: DateTime<Utc>) -> Result<Settled, HandleError> {
        let event: BookingCancelled = decode(payload)?;
        if event.booking_id.is_nil() {
            return Err(HandleError::Malformed("booking id must be set".into()));
        }

        let payment = match self.ledger.find_by_booking(event.booking_id).await {
            Ok(Some(payment)) => payment,
            Ok(None) => return Ok(Settled::Skipped("no payment for booking")),
            Err(e) => return Err(HandleError::Transient(e)),
        };
        if payment.status != PaymentStatus::Completed {
            return Ok(Settled::Skipped("payment not completed"));
        }
        let remaining = payment.refundable();
        if remaining <= 0 {
            return Ok(Settled::Skipped("nothing left to refund"));
        }

        match self
            .ledger
            .refund(payment.id, remaining, CANCELLATION_REFUND_REASON, now)
            .await
        {
            Ok(refund) => Ok(Settled::Refunded {
                payment_id: payment.id,
                amount: refund.amount,
            }),
            // A concurrent refund got there first.
            Err(LedgerError::NotCompleted(_) | LedgerError::RefundExceedsRemaining { .. }) => {
                Ok(Settled::Skipped("payment changed concurrently"))
            }
            Err(e) if e.is_permanent() => Err(HandleError::Malformed(e.to_string())),
            Err(e) => Err(HandleError::Transient(e)),
        }
    }

    async fn handle(&self, kind: EventKind, payload: &[u8]) -> Result<Settled, HandleError> {
        match kind {
            EventKind::Created => self.handle_created(payload, Utc::now()).await,
            EventKind::Cancelled => self.handle_cancelled(payload, Utc::now()).await,
        }
    }

    /// Runs one message to a final outcome, retrying transient failures and
    /// parking the message once retries are exhausted.
    pub async fn process(&self, kind: EventKind, message: &Inbound, shutdown: &CancellationToken) -> Disposition {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.handle(kind, &message.payload).await {
                Ok(settled) => {
                    info!(event = kind.as_str(), offset = message.offset, outcome = ?settled, "message settled");
                    return Disposition::Done;
                }
                Err(e @ HandleError::Malformed(_)) => e,
                Err(e) if attempt >= self.retry.max_attempts => e,
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        event = kind.as_str(),
                        offset = message.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "settlement failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Disposition::Interrupted,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            return self.park(message, &error, attempt, shutdown).await;
        }
    }

    /// Stores the dead letter, retrying the write until it lands or shutdown
    /// fires. An unstored letter is never reported as parked.
    async fn park(
        &self,
        message: &Inbound,
        error: &HandleError,
        attempts: u32,
        shutdown: &CancellationToken,
    ) -> Disposition {
        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            attempts,
            error = %error,
            "moving message to dead letters"
        );
        let letter = DeadLetter {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.clone(),
            payload: message.payload.clone(),
            error: error.to_string(),
            attempts,
        };
        let mut write = 0;
        loop {
            write += 1;
            let Err(e) = self.dead_letters.park(letter.clone()).await else {
                return Disposition::DeadLettered;
            };
            let delay = self.retry.delay_for(write);
            error!(
                offset = message.offset,
                write,
                delay_ms = delay.as_millis() as u64,
                error = %e,
                "failed to store dead letter, retrying"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return Disposition::Interrupted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Consumes `kind` events one at a time until `shutdown` fires.
pub async fn run_listener(
    settlement: Arc<Settlement>,
    consumer: StreamConsumer,
    kind: EventKind,
    shutdown: CancellationToken,
) {
    info!(event = kind.as_str(), "settlement listener started");
    let mut message_stream = consumer.stream();

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = message_stream.next() => next,
        };
        let Some(message) = next else { break };

        match message {
            Ok(m) => {
                let inbound = Inbound::from_message(&m);
                match settlement.process(kind, &inbound, &shutdown).await {
                    Disposition::Interrupted => break,
                    disposition => {
                        debug!(offset = inbound.offset, ?disposition, "committing offset");
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            error!("Error committing message: {}", e);
                        }
                    }
                }
            }
            Err(e) => error!("Error receiving message: {}", e),
        }
    }

    info!(event = kind.as_str(), "settlement listener stopped");
}
