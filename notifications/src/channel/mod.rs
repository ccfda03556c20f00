//! The message channel seam: a durable named queue that producers publish
//! to and the listener consumes from.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use shared_kernel::{string_key, uuid_key};

#[cfg(any(test, feature = "testing"))]
pub mod in_memory;
pub mod rabbitmq;

string_key!(QueueName);
uuid_key!(MessageId);

pub const DEFAULT_QUEUE: &str = "schedule_notifications";
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "schedule_notifications.dead_letter";

/// The queues the listener declares before use. Every queue is declared
/// durable with no arguments, so a producer that declared the main queue
/// plainly first is compatible with it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueTopology {
    pub queue: QueueName,
    /// Dead-lettered messages are copied here when set; otherwise they are
    /// only acknowledged.
    #[serde(default)]
    pub dead_letter_queue: Option<QueueName>,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            queue: QueueName::from(DEFAULT_QUEUE),
            dead_letter_queue: Some(QueueName::from(DEFAULT_DEAD_LETTER_QUEUE)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl OutgoingMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: MessageId::generate(),
            payload,
        }
    }
}

pub type DeliveryStream = BoxStream<'static, anyhow::Result<Box<dyn IncomingMessage>>>;

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn ChannelSession>>;
}

#[async_trait]
pub trait ChannelSession: Send + Sync {
    async fn declare(&self, topology: &QueueTopology) -> anyhow::Result<()>;

    /// Resolves once the broker has taken responsibility for the message.
    async fn publish(&self, queue: &QueueName, message: OutgoingMessage) -> anyhow::Result<()>;

    /// Consumes `topology.queue`. Deliveries dead-letter into
    /// `topology.dead_letter_queue`. `prefetch == 0` leaves the broker default
    /// in place.
    async fn consume(
        &self,
        topology: &QueueTopology,
        prefetch: u16,
    ) -> anyhow::Result<DeliveryStream>;

    async fn close(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait IncomingMessage: Send + Sync {
    fn body(&self) -> &[u8];

    fn message_id(&self) -> Option<String>;

    async fn ack(&self) -> anyhow::Result<()>;

    /// Publishes a copy to the dead-letter queue, if there is one, then acks.
    /// The message is never requeued.
    async fn dead_letter(&self) -> anyhow::Result<()>;
}
