//! Broker seam: fan-out of relay frames across relay instances.
//!
//! Every relay instance publishes its frames to a shared fan-out topic and
//! consumes from it, so a frame published by any instance reaches every
//! socket of every instance. The [`Broker`] trait establishes sessions; the
//! [`BrokerBridge`] owns the session lifecycle, retry budget and consumer
//! loop on top of it.
//!
//! Two backends ship with the relay:
//!
//! * [`AmqpBroker`] - AMQP 0-9-1 fanout exchange (RabbitMQ)
//! * [`MemoryBroker`] - in-process broadcast, used by tests and single-node runs

pub mod amqp;
pub mod bridge;
pub mod memory;

pub use amqp::AmqpBroker;
pub use bridge::{BridgeState, BrokerBridge};
pub use memory::{MemoryBroker, MemoryBrokerStats};

use crate::error::BrokerError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

/// Establishes broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects, declares the fan-out topology and returns a ready session.
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError>;

    /// Short backend name used in logs.
    fn name(&self) -> &'static str;
}

/// One established broker session.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Publishes an encoded frame to the fan-out topic.
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError>;

    /// Starts consuming from this instance's subscription.
    ///
    /// The stream ends when the session is lost or closed.
    async fn consume(&self) -> Result<BoxStream<'static, Result<BrokerDelivery, BrokerError>>, BrokerError>;

    /// Cancels the consumer and releases the session.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Acknowledgement handle for one delivery.
#[async_trait]
pub trait DeliveryAcker: Send {
    /// Confirms the delivery was handled.
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Discards the delivery without requeueing it.
    async fn reject(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A frame consumed from the broker, awaiting acknowledgement.
pub struct BrokerDelivery {
    pub payload: Vec<u8>,
    acker: Box<dyn DeliveryAcker>,
}

impl BrokerDelivery {
    pub fn new(payload: Vec<u8>, acker: Box<dyn DeliveryAcker>) -> Self {
        Self { payload, acker }
    }

    /// Acknowledges the delivery.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Rejects the delivery without requeue.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for BrokerDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerDelivery")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Waits between broker connection attempts.
///
/// Abstracted so the retry policy can be observed without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
