//! Message broker seam.
//!
//! Queues are durable and messages persistent on the AMQP backend. A
//! subscription is a stream of deliveries the broker hands out at most
//! `prefetch` at a time; each delivery must be acked or rejected.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;

#[derive(Debug)]
pub enum BrokerError {
    Amqp(lapin::Error),
    Encode(serde_json::Error),
    /// Queue closed or not declared
    Closed(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amqp(e) => write!(f, "AMQP: {e}"),
            Self::Encode(e) => write!(f, "encode: {e}"),
            Self::Closed(queue) => write!(f, "queue closed: {queue}"),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<lapin::Error> for BrokerError {
    fn from(e: lapin::Error) -> Self {
        Self::Amqp(e)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e)
    }
}

/// One message handed to a consumer
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), BrokerError>;

    /// Reject without requeue; the message is dropped
    async fn reject(&self) -> Result<(), BrokerError>;
}

pub type Subscription = BoxStream<'static, Result<Box<dyn Delivery>, BrokerError>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare `queue` durable (idempotent).
    async fn declare(&self, queue: &str) -> Result<(), BrokerError>;

    /// Publish one persistent message to `queue` via the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Declare `queue` and start consuming with at most `prefetch` unacked deliveries.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Subscription, BrokerError>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T: Serialize + ?Sized>(
    broker: &dyn Broker,
    queue: &str,
    message: &T,
) -> Result<(), BrokerError> {
    let body = serde_json::to_vec(message)?;
    broker.publish(queue, &body).await
}
