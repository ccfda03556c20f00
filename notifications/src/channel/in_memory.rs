//! A process-local broker with the delivery semantics the listener relies
//! on: messages published before anyone consumes are buffered, dead-lettered
//! messages are copied to the dead-letter queue and acked, and connects can be
//! made to fail.

use crate::channel::{
    ChannelConnector, ChannelSession, DeliveryStream, IncomingMessage, MessageId, OutgoingMessage,
    QueueName, QueueTopology,
};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Clone)]
struct StoredMessage {
    id: MessageId,
    payload: Vec<u8>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    consumer: Option<Consumer>,
    published: Vec<Vec<u8>>,
    acked: Vec<Vec<u8>>,
    dead_lettered: Vec<Vec<u8>>,
}

struct Consumer {
    sender: mpsc::UnboundedSender<Box<dyn IncomingMessage>>,
    dead_letter_queue: Option<QueueName>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueName, QueueState>,
    connect_attempts: usize,
    failing_connects: usize,
    unreachable: bool,
    closed_sessions: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_queue<T>(&self, queue: &str, read: impl FnOnce(&QueueState) -> T) -> Option<T> {
        self.lock().queues.get(&QueueName::from(queue)).map(read)
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().failing_connects = count;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn closed_sessions(&self) -> usize {
        self.lock().closed_sessions
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.read_queue(queue, |_| ()).is_some()
    }

    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.read_queue(queue, |q| q.published.clone())
            .unwrap_or_default()
    }

    pub fn acked(&self, queue: &str) -> Vec<Vec<u8>> {
        self.read_queue(queue, |q| q.acked.clone()).unwrap_or_default()
    }

    /// Messages consumed from `queue` and then dead-lettered.
    pub fn dead_lettered(&self, queue: &str) -> Vec<Vec<u8>> {
        self.read_queue(queue, |q| q.dead_lettered.clone())
            .unwrap_or_default()
    }

    /// Messages waiting for a consumer.
    pub fn ready(&self, queue: &str) -> usize {
        self.read_queue(queue, |q| q.ready.len()).unwrap_or_default()
    }

    /// Simulates a dropped connection: every open delivery stream ends.
    pub fn drop_consumers(&self) {
        for queue in self.lock().queues.values_mut() {
            queue.consumer = None;
        }
    }

    fn enqueue(
        &self,
        state: &mut BrokerState,
        queue: &QueueName,
        message: StoredMessage,
    ) -> anyhow::Result<()> {
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow!("queue {queue} has not been declared"))?;

        let delivered = match &queue_state.consumer {
            Some(consumer) => {
                let delivery = InMemoryMessage {
                    broker: self.clone(),
                    queue: queue.clone(),
                    dead_letter_queue: consumer.dead_letter_queue.clone(),
                    message: message.clone(),
                };
                consumer.sender.send(Box::new(delivery)).is_ok()
            }
            None => false,
        };
        if !delivered {
            queue_state.consumer = None;
            queue_state.ready.push_back(message);
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelConnector for InMemoryBroker {
    async fn connect(&self) -> anyhow::Result<Box<dyn ChannelSession>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.unreachable {
            bail!("connection refused");
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            bail!("connection refused");
        }
        Ok(Box::new(InMemorySession {
            broker: self.clone(),
        }))
    }
}

struct InMemorySession {
    broker: InMemoryBroker,
}

#[async_trait]
impl ChannelSession for InMemorySession {
    async fn declare(&self, topology: &QueueTopology) -> anyhow::Result<()> {
        let mut state = self.broker.lock();
        for queue in topology.dead_letter_queue.iter().chain([&topology.queue]) {
            state.queues.entry(queue.clone()).or_default();
        }
        Ok(())
    }

    async fn publish(&self, queue: &QueueName, message: OutgoingMessage) -> anyhow::Result<()> {
        let mut state = self.broker.lock();
        let stored = StoredMessage {
            id: message.id,
            payload: message.payload,
        };
        self.broker.enqueue(&mut state, queue, stored.clone())?;
        if let Some(queue_state) = state.queues.get_mut(queue) {
            queue_state.published.push(stored.payload);
        }
        Ok(())
    }

    async fn consume(
        &self,
        topology: &QueueTopology,
        _prefetch: u16,
    ) -> anyhow::Result<DeliveryStream> {
        let queue = &topology.queue;
        let (sender, receiver) = mpsc::unbounded_channel::<Box<dyn IncomingMessage>>();
        let mut state = self.broker.lock();
        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| anyhow!("queue {queue} has not been declared"))?;

        while let Some(message) = queue_state.ready.pop_front() {
            let delivery = InMemoryMessage {
                broker: self.broker.clone(),
                queue: queue.clone(),
                dead_letter_queue: topology.dead_letter_queue.clone(),
                message,
            };
            // the receiver is alive in this scope
            let _ = sender.send(Box::new(delivery));
        }
        queue_state.consumer = Some(Consumer {
            sender,
            dead_letter_queue: topology.dead_letter_queue.clone(),
        });

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|message| (Ok(message), receiver))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.broker.lock().closed_sessions += 1;
        Ok(())
    }
}

struct InMemoryMessage {
    broker: InMemoryBroker,
    queue: QueueName,
    dead_letter_queue: Option<QueueName>,
    message: StoredMessage,
}

#[async_trait]
impl IncomingMessage for InMemoryMessage {
    fn body(&self) -> &[u8] {
        &self.message.payload
    }

    fn message_id(&self) -> Option<String> {
        Some(self.message.id.to_string())
    }

    async fn ack(&self) -> anyhow::Result<()> {
        let mut state = self.broker.lock();
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| anyhow!("queue {} vanished", self.queue))?;
        queue.acked.push(self.message.payload.clone());
        Ok(())
    }

    async fn dead_letter(&self) -> anyhow::Result<()> {
        if let Some(dead_letter_queue) = &self.dead_letter_queue {
            let mut state = self.broker.lock();
            self.broker
                .enqueue(&mut state, dead_letter_queue, self.message.clone())?;
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.dead_lettered.push(self.message.payload.clone());
            }
        }
        self.ack().await
    }
}
