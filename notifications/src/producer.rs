use crate::channel::{ChannelConnector, MessageId, OutgoingMessage, QueueTopology};
use crate::event::{EntityId, NotificationMessage, ScheduleSnapshot};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published(MessageId),
    /// The broker could not be reached or refused the message. The failure
    /// has been logged and the notification is lost.
    Dropped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactDetails {
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// The user store, as far as invitations need it.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn find_contact(&self, user: &EntityId) -> anyhow::Result<Option<ContactDetails>>;
}

#[derive(Debug, Error)]
pub enum InviteError {
    #[error("user {0} does not exist")]
    RecipientNotFound(EntityId),
    #[error("user {user} has no {missing} on file")]
    IncompleteContact {
        user: EntityId,
        missing: &'static str,
    },
    #[error(transparent)]
    Lookup(anyhow::Error),
}

pub struct NotificationPublisher {
    connector: Arc<dyn ChannelConnector>,
    topology: QueueTopology,
}

impl NotificationPublisher {
    pub fn new(connector: Arc<dyn ChannelConnector>, topology: QueueTopology) -> Self {
        Self {
            connector,
            topology,
        }
    }

    /// Opens a short-lived session, publishes one persistent message and
    /// waits for the broker to confirm it. Never fails: problems are logged
    /// and reported as [`PublishOutcome::Dropped`].
    #[tracing::instrument(skip_all, fields(kind = ?message.kind(), title = %message.title))]
    pub async fn publish(&self, message: &NotificationMessage) -> PublishOutcome {
        match self.try_publish(message).await {
            Ok(id) => {
                info!(message_id = %id, "Notification queued");
                PublishOutcome::Published(id)
            }
            Err(err) => {
                error!(error = ?err, "Failed to queue notification, it will not be sent");
                PublishOutcome::Dropped
            }
        }
    }

    pub async fn publish_new_schedule(&self, schedule: ScheduleSnapshot) -> PublishOutcome {
        self.publish(&NotificationMessage::broadcast(schedule))
            .await
    }

    /// Looks the invitee up before publishing anything; an unknown user or
    /// one without an email and phone number is reported to the caller.
    pub async fn publish_invite(
        &self,
        schedule: ScheduleSnapshot,
        invitee: &EntityId,
        directory: &dyn RecipientDirectory,
    ) -> Result<PublishOutcome, InviteError> {
        let contact = directory
            .find_contact(invitee)
            .await
            .map_err(InviteError::Lookup)?
            .ok_or_else(|| InviteError::RecipientNotFound(invitee.clone()))?;

        let email = present(contact.email).ok_or_else(|| InviteError::IncompleteContact {
            user: invitee.clone(),
            missing: "email",
        })?;
        let phone = present(contact.phone).ok_or_else(|| InviteError::IncompleteContact {
            user: invitee.clone(),
            missing: "phone number",
        })?;

        Ok(self
            .publish(&NotificationMessage::targeted(schedule, email, phone))
            .await)
    }

    async fn try_publish(&self, message: &NotificationMessage) -> anyhow::Result<MessageId> {
        let payload = message
            .to_bytes()
            .context("Failed to serialize notification")?;
        let outgoing = OutgoingMessage::new(payload);
        let id = outgoing.id;

        let session = self.connector.connect().await?;
        let published = async {
            session.declare(&self.topology).await?;
            session.publish(&self.topology.queue, outgoing).await
        }
        .await;

        if let Err(err) = session.close().await {
            warn!(error = ?err, "Failed to close the publisher session");
        }
        published.map(|_| id)
    }
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::in_memory::InMemoryBroker;
    use crate::event::NotificationKind;
    use mockall::predicate::eq;

    fn publisher(broker: &InMemoryBroker) -> NotificationPublisher {
        NotificationPublisher::new(Arc::new(broker.clone()), QueueTopology::default())
    }

    fn snapshot() -> ScheduleSnapshot {
        ScheduleSnapshot {
            schedule_id: Some(12.into()),
            title: "Quarterly review".to_owned(),
            schedule_time: "2025-02-01T10:00:00+07:00".to_owned(),
            created_by: Some(1.into()),
        }
    }

    fn queue() -> String {
        QueueTopology::default().queue.to_string()
    }

    fn directory_returning(contact: Option<ContactDetails>) -> MockRecipientDirectory {
        let mut directory = MockRecipientDirectory::new();
        directory
            .expect_find_contact()
            .with(eq(EntityId::from(42)))
            .times(1)
            .returning(move |_| Ok(contact.clone()));
        directory
    }

    #[tokio::test]
    async fn test_new_schedule_is_published_as_a_broadcast() {
        let broker = InMemoryBroker::new();

        let outcome = publisher(&broker).publish_new_schedule(snapshot()).await;

        assert!(matches!(outcome, PublishOutcome::Published(_)));
        let published = broker.published(&queue());
        assert_eq!(published.len(), 1);
        let message = NotificationMessage::from_bytes(&published[0]).unwrap();
        assert_eq!(message.kind(), NotificationKind::Broadcast);
        assert_eq!(message.title, "Quarterly review");
        assert_eq!(broker.closed_sessions(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_broker_drops_the_notification() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true);

        let outcome = publisher(&broker).publish_new_schedule(snapshot()).await;

        assert_eq!(outcome, PublishOutcome::Dropped);
        assert!(broker.published(&queue()).is_empty());
    }

    #[tokio::test]
    async fn test_each_publish_enqueues_exactly_one_message() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);

        for _ in 0..3 {
            publisher.publish_new_schedule(snapshot()).await;
        }

        assert_eq!(broker.published(&queue()).len(), 3);
        assert_eq!(broker.ready(&queue()), 3);
    }

    #[tokio::test]
    async fn test_invite_carries_the_invitee_contact() {
        let broker = InMemoryBroker::new();
        let directory = directory_returning(Some(ContactDetails {
            email: Some("guest@example.com".to_owned()),
            phone: Some("6281234567890".to_owned()),
        }));

        let outcome = publisher(&broker)
            .publish_invite(snapshot(), &EntityId::from(42), &directory)
            .await
            .unwrap();

        assert!(matches!(outcome, PublishOutcome::Published(_)));
        let message = NotificationMessage::from_bytes(&broker.published(&queue())[0]).unwrap();
        assert_eq!(message.kind(), NotificationKind::Targeted);
        assert_eq!(message.recipient_email.as_deref(), Some("guest@example.com"));
        assert_eq!(message.recipient_phone.as_deref(), Some("6281234567890"));
    }

    #[tokio::test]
    async fn test_unknown_invitee_publishes_nothing() {
        let broker = InMemoryBroker::new();
        let directory = directory_returning(None);

        let result = publisher(&broker)
            .publish_invite(snapshot(), &EntityId::from(42), &directory)
            .await;

        assert!(matches!(result, Err(InviteError::RecipientNotFound(_))));
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_invitee_without_phone_publishes_nothing() {
        let broker = InMemoryBroker::new();
        let directory = directory_returning(Some(ContactDetails {
            email: Some("guest@example.com".to_owned()),
            phone: Some("  ".to_owned()),
        }));

        let result = publisher(&broker)
            .publish_invite(snapshot(), &EntityId::from(42), &directory)
            .await;

        assert!(matches!(
            result,
            Err(InviteError::IncompleteContact {
                missing: "phone number",
                ..
            })
        ));
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_directory_failure_is_reported() {
        let broker = InMemoryBroker::new();
        let mut directory = MockRecipientDirectory::new();
        directory
            .expect_find_contact()
            .returning(|_| Err(anyhow::anyhow!("database is down")));

        let result = publisher(&broker)
            .publish_invite(snapshot(), &EntityId::from(42), &directory)
            .await;

        assert!(matches!(result, Err(InviteError::Lookup(_))));
        assert_eq!(broker.connect_attempts(), 0);
    }
}
