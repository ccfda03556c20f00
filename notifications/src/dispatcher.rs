use crate::channel::IncomingMessage;
use crate::config::{ChatSettings, EmailSettings};
use crate::delivery::{DeliveryStrategy, Notification};
use crate::event::{NotificationEvent, Recipient};
use anyhow::Context;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// What happens to a delivery whose body is not a valid notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedMessagePolicy {
    /// Copy it to the dead-letter queue, then acknowledge.
    #[default]
    DeadLetter,
    /// Acknowledge and forget.
    Drop,
}

/// Decides who receives a notification: broadcasts go to the configured
/// mailbox and phone, targeted notifications to the recipient they carry.
#[derive(Debug, Clone)]
pub struct RecipientPolicy {
    broadcast: Recipient,
}

impl RecipientPolicy {
    pub fn new(broadcast: Recipient) -> Self {
        Self { broadcast }
    }

    pub fn from_settings(email: &EmailSettings, chat: &ChatSettings) -> anyhow::Result<Self> {
        let mailbox = email.broadcast_mailbox();
        let recipient = Recipient {
            email: mailbox
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid broadcast mailbox {mailbox}"))?,
            phone: chat
                .broadcast_phone
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid broadcast phone {}", chat.broadcast_phone))?,
        };
        Ok(Self::new(recipient))
    }

    pub fn resolve(&self, event: NotificationEvent) -> Notification {
        match event {
            NotificationEvent::Broadcast(schedule) => Notification {
                recipient: self.broadcast.clone(),
                schedule,
            },
            NotificationEvent::Targeted {
                schedule,
                recipient,
            } => Notification {
                recipient,
                schedule,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlingOutcome {
    /// Every strategy ran; `failed` names the ones that returned an error.
    Delivered { failed: Vec<&'static str> },
    DeadLettered,
    Dropped,
}

pub struct Dispatcher {
    strategies: Vec<Arc<dyn DeliveryStrategy>>,
    recipients: RecipientPolicy,
    malformed_messages: MalformedMessagePolicy,
}

impl Dispatcher {
    pub fn new(recipients: RecipientPolicy, malformed_messages: MalformedMessagePolicy) -> Self {
        Self {
            strategies: vec![],
            recipients,
            malformed_messages,
        }
    }

    /// Strategies run in the order they are added.
    pub fn with_strategy(mut self, strategy: Arc<dyn DeliveryStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    #[tracing::instrument(skip_all, fields(message_id = ?message.message_id()))]
    pub async fn handle(&self, message: &dyn IncomingMessage) -> HandlingOutcome {
        let event = match NotificationEvent::decode(message.body()) {
            Ok(event) => event,
            Err(err) => return self.discard(message, err.into()).await,
        };

        info!(kind = ?event.kind(), title = %event.schedule().title, "Dispatching notification");
        let notification = self.recipients.resolve(event);
        let failed = self.deliver(&notification).await;

        // acknowledged whatever the adapters did
        if let Err(err) = message.ack().await {
            error!(error = ?err, "Failed to acknowledge notification");
        }

        HandlingOutcome::Delivered { failed }
    }

    async fn deliver(&self, notification: &Notification) -> Vec<&'static str> {
        let mut failed = vec![];
        for strategy in &self.strategies {
            if let Err(err) = strategy.deliver(notification).await {
                error!(strategy = strategy.name(), error = ?err, "Failed to deliver notification");
                failed.push(strategy.name());
            }
        }
        failed
    }

    async fn discard(&self, message: &dyn IncomingMessage, reason: anyhow::Error) -> HandlingOutcome {
        match self.malformed_messages {
            MalformedMessagePolicy::DeadLetter => {
                warn!(error = %reason, "Dead-lettering malformed notification");
                if let Err(err) = message.dead_letter().await {
                    error!(error = ?err, "Failed to dead-letter malformed notification");
                }
                HandlingOutcome::DeadLettered
            }
            MalformedMessagePolicy::Drop => {
                warn!(error = %reason, "Dropping malformed notification");
                if let Err(err) = message.ack().await {
                    error!(error = ?err, "Failed to acknowledge malformed notification");
                }
                HandlingOutcome::Dropped
            }
        }
    }
}
