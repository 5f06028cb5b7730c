use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use shared::{BookingCancelled, BookingCreated, TOPIC_BOOKING_CANCELLED, TOPIC_BOOKING_CREATED};
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to deliver to {topic}: {reason}")]
    Delivery { topic: String, reason: String },
}

/// Emits booking lifecycle events. Events of one booking share a key, so they
/// land on one partition in the order they were published.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_created(&self, event: &BookingCreated) -> Result<(), PublishError>;
    async fn publish_cancelled(&self, event: &BookingCancelled) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub brokers: String,
    pub created_topic: String,
    pub cancelled_topic: String,
    pub delivery_timeout: Duration,
}

impl PublisherConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            created_topic: TOPIC_BOOKING_CREATED.to_string(),
            cancelled_topic: TOPIC_BOOKING_CANCELLED.to_string(),
            delivery_timeout: Duration::from_secs(5),
        }
    }
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    config: PublisherConfig,
}

impl KafkaPublisher {
    pub fn new(config: PublisherConfig) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.delivery_timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()?;

        Ok(Self { producer, config })
    }

    async fn send<T: Serialize>(&self, topic: &str, key: &str, event: &T) -> Result<(), PublishError> {
        let json = serde_json::to_string(event)?;
        let record = FutureRecord::to(topic).payload(&json).key(key);

        match self.producer.send(record, self.config.delivery_timeout).await {
            Ok((partition, offset)) => {
                debug!(topic, key, partition, offset, "event published");
                Ok(())
            }
            Err((e, _)) => {
                error!(topic, key, error = %e, "failed to publish event");
                Err(PublishError::Delivery {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish_created(&self, event: &BookingCreated) -> Result<(), PublishError> {
        self.send(&self.config.created_topic, &event.key(), event).await
    }

    async fn publish_cancelled(&self, event: &BookingCancelled) -> Result<(), PublishError> {
        self.send(&self.config.cancelled_topic, &event.key(), event).await
    }
}
