use notifications::channel::rabbitmq::RabbitMqConnector;
use notifications::channel::ChannelConnector;
use notifications::config::{ChannelSettings, Settings};
use notifications::delivery::email::EmailStrategy;
use notifications::delivery::whatsapp::WhatsAppStrategy;
use notifications::dispatcher::{Dispatcher, RecipientPolicy};
use notifications::listener::{Listener, ListenerConfig};
use notifications::producer::NotificationPublisher;
use std::sync::Arc;

pub fn connector(channel: &ChannelSettings) -> Arc<dyn ChannelConnector> {
    Arc::new(RabbitMqConnector::new(channel.url.clone()))
}

/// Email goes out before WhatsApp for every notification.
pub fn listener(
    settings: &Settings,
    connector: Arc<dyn ChannelConnector>,
) -> anyhow::Result<Listener> {
    let timezone = settings.dispatch.timezone;
    let email = EmailStrategy::new(&settings.email, timezone)?;
    let chat = WhatsAppStrategy::new(&settings.chat, timezone)?;
    let recipients = RecipientPolicy::from_settings(&settings.email, &settings.chat)?;

    let dispatcher = Dispatcher::new(recipients, settings.dispatch.malformed_messages)
        .with_strategy(Arc::new(email))
        .with_strategy(Arc::new(chat));

    let config = ListenerConfig {
        topology: settings.channel.topology.clone(),
        prefetch: settings.channel.prefetch,
        max_in_flight: settings.dispatch.max_in_flight,
        reconnect: settings.dispatch.reconnect,
    };

    Ok(Listener::new(connector, Arc::new(dispatcher), config))
}

pub fn publisher(
    channel: &ChannelSettings,
    connector: Arc<dyn ChannelConnector>,
) -> NotificationPublisher {
    NotificationPublisher::new(connector, channel.topology.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notifications::channel::in_memory::InMemoryBroker;
    use notifications::config::{ChatSettings, DispatchSettings, EmailSettings};
    use notifications::event::{NotificationMessage, ScheduleSnapshot};
    use notifications::listener::ListenerState;
    use notifications::producer::PublishOutcome;
    use secrecy::Secret;
    use tokio_util::sync::CancellationToken;

    fn settings() -> Settings {
        Settings {
            channel: ChannelSettings {
                url: Secret::new("amqp://localhost".to_owned()),
                topology: Default::default(),
                prefetch: 0,
            },
            email: EmailSettings {
                smtp_host: "smtp.example.com".to_owned(),
                smtp_port: 465,
                security: Default::default(),
                username: "notifier@example.com".to_owned(),
                password: Secret::new("app-password".to_owned()),
                sender_name: "Scheduler".to_owned(),
                broadcast_recipient: None,
            },
            chat: ChatSettings {
                api_base: "https://graph.facebook.com/v18.0".to_owned(),
                api_token: Secret::new("token".to_owned()),
                phone_id: "1234567890".to_owned(),
                template_name: "schedule_notification".to_owned(),
                language_code: "en_US".to_owned(),
                broadcast_phone: "6281234567890".to_owned(),
            },
            dispatch: DispatchSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_listener_is_wired_to_the_configured_queue() {
        let broker = InMemoryBroker::new();
        let listener = listener(&settings(), Arc::new(broker.clone())).unwrap();
        let mut state = listener.state();
        let shutdown = CancellationToken::new();

        let running = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { listener.run(shutdown).await }
        });
        while *state.borrow_and_update() != ListenerState::Listening {
            state.changed().await.unwrap();
        }

        assert!(broker.is_declared("schedule_notifications"));
        assert!(broker.is_declared("schedule_notifications.dead_letter"));

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_invalid_broadcast_phone_is_a_startup_error() {
        let mut settings = settings();
        settings.chat.broadcast_phone = "call me".to_owned();

        assert!(listener(&settings, Arc::new(InMemoryBroker::new())).is_err());
    }

    #[tokio::test]
    async fn test_publisher_uses_the_configured_topology() {
        let broker = InMemoryBroker::new();
        let settings = settings();
        let publisher = publisher(&settings.channel, Arc::new(broker.clone()));

        let outcome = publisher
            .publish(&NotificationMessage::broadcast(ScheduleSnapshot {
                schedule_id: None,
                title: "Demo day".to_owned(),
                schedule_time: "2025-03-01 14:00".to_owned(),
                created_by: None,
            }))
            .await;

        assert!(matches!(outcome, PublishOutcome::Published(_)));
        assert_eq!(broker.ready("schedule_notifications"), 1);
    }
}
