// src/rabbitmq/connection.rs
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery, options::*, types::FieldTable, BasicProperties, Channel, Connection,
    ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::amqp_client::{Broker, BrokerConnection, ConsumerHandle};
use super::errors::{RabbitMQError, Result};
use crate::env::BrokerEndpoint;

const REPLY_SUCCESS: u16 = 200;

/// [`Broker`] backed by a real RabbitMQ server through `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinBroker {
    connection_name: Option<String>,
}

impl LapinBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name reported to the broker's management UI for every connection.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<LapinConnection> {
        debug!("Attempting to connect to RabbitMQ at {}", endpoint);

        let connection = Connection::connect_uri(endpoint.amqp_uri(), self.connection_properties())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect to {}: {}", endpoint, e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to enable publisher confirms: {}", e)))?;

        debug!("Connected to RabbitMQ at {}", endpoint);
        Ok(LapinConnection { connection, channel })
    }
}

/// A lapin connection together with the single channel the worker uses on it.
pub struct LapinConnection {
    connection: Connection,
    channel: Channel,
}

/// Map the broker-defined exchange type onto lapin's kinds.
pub fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "headers" => ExchangeKind::Headers,
        "topic" => ExchangeKind::Topic,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn declare_exchange(&mut self, exchange: &str, exchange_type: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                exchange_kind(exchange_type),
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to declare exchange '{}': {}", exchange, e)))?;

        debug!("Exchange '{}' ({}) declared", exchange, exchange_type);
        Ok(())
    }

    async fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type("application/octet-stream".into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "Broker rejected message for '{}' with routing key '{}'",
                exchange, routing_key
            )));
        }
        Ok(())
    }

    async fn declare_queue(&mut self) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to declare queue: {}", e)))?;

        let name = queue.name().as_str().to_string();
        debug!("Queue '{}' declared", name);
        Ok(name)
    }

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to bind queue: {}", e)))?;

        debug!("Queue '{}' bound to '{}' with '{}'", queue, exchange, routing_key);
        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        handle: &ConsumerHandle,
        on_message: &mut (dyn FnMut(Vec<u8>) + Send),
    ) -> Result<()> {
        let consumer_tag = format!("consumer-{}", &Uuid::new_v4().to_string()[..8]);
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        info!("Started consuming from queue: {}", queue);

        loop {
            tokio::select! {
                _ = handle.stopped() => {
                    if let Err(e) = self
                        .channel
                        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                        .await
                    {
                        warn!("Failed to cancel consumer {}: {}", consumer_tag, e);
                    }
                    return Ok(());
                }
                delivery = consumer.next() => match delivery {
                    Some(Ok(delivery)) => {
                        let Delivery { data, acker, .. } = delivery;
                        on_message(data);
                        acker
                            .ack(BasicAckOptions::default())
                            .await
                            .map_err(|e| RabbitMQError::AckError(e.to_string()))?;
                    }
                    Some(Err(e)) => return Err(RabbitMQError::ConsumeError(e.to_string())),
                    None => {
                        return Err(RabbitMQError::ConsumeError(format!(
                            "consumer {} was cancelled by the broker",
                            consumer_tag
                        )))
                    }
                },
            }
        }
    }

    async fn close(self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "Closing channel")
                .await
                .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(REPLY_SUCCESS, "Closing connection")
                .await
                .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;
        }
        Ok(())
    }
}
