//! AMQP 0-9-1 backend built on `lapin`.
//!
//! Topology: one non-durable fanout exchange, one non-durable queue bound to
//! it with an empty binding key. Frames are published with a fixed routing
//! key, which the fanout exchange ignores.

use super::{Broker, BrokerDelivery, BrokerSession, DeliveryAcker};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Broker speaking AMQP 0-9-1 to RabbitMQ or a compatible server.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    config: BrokerConfig,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connect(format!("channel: {e}")))?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions { durable: false, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connect(format!("exchange declare: {e}")))?;
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions { durable: false, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connect(format!("queue declare: {e}")))?;
        channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Connect(format!("queue bind: {e}")))?;

        info!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            "📡 AMQP topology declared"
        );

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
            exchange: self.config.exchange.clone(),
            queue: self.config.queue.clone(),
            routing_key: self.config.routing_key.clone(),
            consumer_tag: format!("chat-relay-{}", Uuid::new_v4().simple()),
            consuming: Mutex::new(false),
        }))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

struct AmqpSession {
    connection: Connection,
    channel: Channel,
    exchange: String,
    queue: String,
    routing_key: String,
    consumer_tag: String,
    consuming: Mutex<bool>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        self.channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(
        &self,
    ) -> Result<BoxStream<'static, Result<BrokerDelivery, BrokerError>>, BrokerError> {
        let mut consuming = self.consuming.lock().await;
        if *consuming {
            return Err(BrokerError::Consume("consumer already started".to_string()));
        }

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;
        *consuming = true;
        debug!(consumer_tag = %self.consumer_tag, "AMQP consumer started");

        let deliveries = consumer.map(|delivery| {
            let delivery = delivery.map_err(|e| BrokerError::Consume(e.to_string()))?;
            let acker = Box::new(AmqpAcker { acker: delivery.acker });
            Ok(BrokerDelivery::new(delivery.data, acker))
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if *self.consuming.lock().await {
            if let Err(e) = self
                .channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!("Failed to cancel AMQP consumer: {}", e);
            }
        }
        self.channel
            .close(200, "relay shutting down")
            .await
            .map_err(|e| BrokerError::Connect(format!("channel close: {e}")))?;
        self.connection
            .close(200, "relay shutting down")
            .await
            .map_err(|e| BrokerError::Connect(format!("connection close: {e}")))?;
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions { requeue: false, ..Default::default() })
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}
