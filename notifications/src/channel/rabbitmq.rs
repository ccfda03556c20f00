use crate::channel::{
    ChannelConnector, ChannelSession, DeliveryStream, IncomingMessage, MessageId, OutgoingMessage,
    QueueName, QueueTopology,
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::{ExposeSecret, Secret};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const CONTENT_TYPE: &str = "application/json";
const REPLY_SUCCESS: u16 = 200;

pub struct RabbitMqConnector {
    url: Secret<String>,
}

impl RabbitMqConnector {
    pub fn new(url: Secret<String>) -> Self {
        Self { url }
    }
}

#[async_trait]
impl ChannelConnector for RabbitMqConnector {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn connect(&self) -> anyhow::Result<Box<dyn ChannelSession>> {
        let connection =
            Connection::connect(self.url.expose_secret(), ConnectionProperties::default())
                .await
                .context("Failed to connect to the message broker")?;

        let channel = connection
            .create_channel()
            .await
            .context("Failed to open a channel")?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        Ok(Box::new(RabbitMqSession {
            connection,
            channel,
        }))
    }
}

struct RabbitMqSession {
    connection: Connection,
    channel: Channel,
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

/// Dead-letter queue first, so it exists before anything can be routed to
/// it.
fn declared_queues(topology: &QueueTopology) -> Vec<&QueueName> {
    topology
        .dead_letter_queue
        .iter()
        .chain(std::iter::once(&topology.queue))
        .collect()
}

fn message_properties(id: MessageId) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(id.to_string()))
}

async fn publish_confirmed(
    channel: &Channel,
    queue: &QueueName,
    id: MessageId,
    payload: &[u8],
) -> anyhow::Result<()> {
    let confirmation = channel
        .basic_publish(
            "",
            queue.as_str(),
            BasicPublishOptions::default(),
            payload,
            message_properties(id),
        )
        .await
        .with_context(|| format!("Failed to publish to {queue}"))?
        .await
        .with_context(|| format!("Failed to get a publisher confirm from {queue}"))?;

    if confirmation.is_nack() {
        bail!("Broker refused message {id} for {queue}");
    }
    Ok(())
}

#[async_trait]
impl ChannelSession for RabbitMqSession {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn declare(&self, topology: &QueueTopology) -> anyhow::Result<()> {
        for queue in declared_queues(topology) {
            self.channel
                .queue_declare(queue.as_str(), durable(), FieldTable::default())
                .await
                .with_context(|| format!("Failed to declare queue {queue}"))?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, message), fields(message_id = %message.id), level = "debug")]
    async fn publish(&self, queue: &QueueName, message: OutgoingMessage) -> anyhow::Result<()> {
        publish_confirmed(&self.channel, queue, message.id, &message.payload).await
    }

    #[tracing::instrument(skip(self), level = "debug")]
    async fn consume(
        &self,
        topology: &QueueTopology,
        prefetch: u16,
    ) -> anyhow::Result<DeliveryStream> {
        let queue = &topology.queue;
        if prefetch > 0 {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .context("Failed to set prefetch")?;
        }

        // empty tag: the broker assigns one
        let consumer = self
            .channel
            .basic_consume(
                queue.as_str(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to start consuming {queue}"))?;

        let channel = self.channel.clone();
        let dead_letter_queue = topology.dead_letter_queue.clone();
        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|delivery| {
                    Box::new(RabbitMqMessage {
                        delivery,
                        channel: channel.clone(),
                        dead_letter_queue: dead_letter_queue.clone(),
                    }) as Box<dyn IncomingMessage>
                })
                .context("Failed to receive a delivery")
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .context("Failed to close channel")?;
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .context("Failed to close connection")
    }
}

struct RabbitMqMessage {
    delivery: Delivery,
    channel: Channel,
    dead_letter_queue: Option<QueueName>,
}

#[async_trait]
impl IncomingMessage for RabbitMqMessage {
    fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    fn message_id(&self) -> Option<String> {
        self.delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
    }

    async fn ack(&self) -> anyhow::Result<()> {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .context("Failed to ack delivery")
    }

    async fn dead_letter(&self) -> anyhow::Result<()> {
        if let Some(dead_letter_queue) = &self.dead_letter_queue {
            let id = self
                .message_id()
                .and_then(|id| id.parse().ok())
                .unwrap_or_else(MessageId::generate);
            publish_confirmed(&self.channel, dead_letter_queue, id, &self.delivery.data).await?;
        }
        self.ack().await
    }
}
