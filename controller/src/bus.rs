//! RabbitMQ plumbing: one robust connection, a small managed channel
//! pool, durable declares, persistent JSON publishing and manual-ack
//! consumers.

use anyhow::{Context, Result, anyhow};
use deadpool::managed::{self, Metrics, Object, Pool, RecycleError, RecycleResult};
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use serde::Serialize;

use fovea_common::config::RabbitConfig;

/// Exchange carrying both command acks and reconciler notifications,
/// under distinct routing keys.
pub const ACK_EXCHANGE: &str = "instance_ack_exchange";

/// Per-channel unacknowledged delivery cap.
const PREFETCH: u16 = 10;

const CHANNEL_POOL_SIZE: usize = 5;

pub struct ChannelManager {
    connection: Connection,
}

impl managed::Manager for ChannelManager {
    type Type = Channel;
    type Error = lapin::Error;

    async fn create(&self) -> Result<Channel, lapin::Error> {
        self.connection.create_channel().await
    }

    async fn recycle(&self, channel: &mut Channel, _: &Metrics) -> RecycleResult<lapin::Error> {
        if channel.status().connected() {
            Ok(())
        } else {
            Err(RecycleError::Message("channel disconnected".into()))
        }
    }
}

pub struct Bus {
    channels: Pool<ChannelManager>,
}

impl Bus {
    pub async fn connect(cfg: &RabbitConfig) -> Result<Self> {
        let connection = Connection::connect(&cfg.url(), ConnectionProperties::default())
            .await
            .context("failed to connect to RabbitMQ")?;
        tracing::info!(url = %cfg.url_redacted(), "connected to RabbitMQ");

        let channels = Pool::builder(ChannelManager { connection })
            .max_size(CHANNEL_POOL_SIZE)
            .build()
            .context("failed to build channel pool")?;
        Ok(Bus { channels })
    }

    async fn channel(&self) -> Result<Object<ChannelManager>> {
        self.channels
            .get()
            .await
            .map_err(|e| anyhow!("failed to acquire AMQP channel: {e}"))
    }

    /// Publishes `body` as persistent JSON through a lazily declared
    /// durable exchange.
    pub async fn publish<T: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &T,
    ) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to declare exchange")?;

        let payload = serde_json::to_vec(body).context("failed to serialize message")?;
        tracing::debug!(exchange, routing_key, "publishing message");
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .context("failed to publish message")?
            .await
            .context("failed to confirm publish")?;
        Ok(())
    }

    /// Consumer on the shared control queue: every command here is meant
    /// for this replica. The channel is taken out of the pool for the
    /// consumer's lifetime.
    pub async fn consume_unique(&self, queue: &str) -> Result<Consumer> {
        let channel = Object::take(self.channel().await?);
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .context("failed to set prefetch")?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to declare control queue")?;
        let consumer = channel
            .basic_consume(
                queue,
                "fovea-controller",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to start control consumer")?;
        tracing::info!(queue, "consuming control queue");
        Ok(consumer)
    }

    /// Consumer on a per-replica queue bound to the control fan-out
    /// exchange. Commands here may target devices owned elsewhere.
    pub async fn consume_shared(&self, controller_queue: &str) -> Result<Consumer> {
        let channel = Object::take(self.channel().await?);
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await
            .context("failed to set prefetch")?;

        let exchange = format!("{controller_queue}_exchange");
        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to declare fan-out exchange")?;

        // Server-named queue, gone with this replica
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("failed to declare shared queue")?;
        channel
            .queue_bind(
                queue.name().as_str(),
                &exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to bind shared queue")?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "fovea-controller-shared",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("failed to start shared consumer")?;
        tracing::info!(queue = %queue.name(), exchange, "consuming shared queue");
        Ok(consumer)
    }
}
