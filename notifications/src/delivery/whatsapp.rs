use crate::config::ChatSettings;
use crate::delivery::{render_schedule_time, DeliveryStrategy, Notification};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono_tz::Tz;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use shared_kernel::http_client::{HttpClient, HttpClientError};
use std::collections::HashMap;
use url::Url;

/// Sends a pre-approved message template through the WhatsApp Cloud API.
pub struct WhatsAppStrategy {
    endpoint: Url,
    api_token: Secret<String>,
    template_name: String,
    language_code: String,
    timezone: Tz,
}

#[derive(Serialize)]
struct TemplateMessage<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    template: Template<'a>,
}

#[derive(Serialize)]
struct Template<'a> {
    name: &'a str,
    language: Language<'a>,
    components: Vec<Component>,
}

#[derive(Serialize)]
struct Language<'a> {
    code: &'a str,
}

#[derive(Serialize)]
struct Component {
    #[serde(rename = "type")]
    kind: &'static str,
    parameters: Vec<TextParameter>,
}

#[derive(Serialize)]
struct TextParameter {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

impl TextParameter {
    fn new(text: String) -> Self {
        Self { kind: "text", text }
    }
}

#[derive(Deserialize, Debug)]
struct SentMessages {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Deserialize, Debug)]
struct SentMessage {
    id: String,
}

#[derive(Deserialize)]
struct ProviderErrorBody {
    error: ProviderError,
}

#[derive(Deserialize)]
struct ProviderError {
    message: String,
}

fn provider_error_message(body: &str) -> Option<String> {
    serde_json::from_str::<ProviderErrorBody>(body)
        .ok()
        .map(|body| body.error.message)
}

impl WhatsAppStrategy {
    pub fn new(settings: &ChatSettings, timezone: Tz) -> anyhow::Result<Self> {
        let mut endpoint = Url::parse(&settings.api_base)
            .with_context(|| format!("Invalid url {}", settings.api_base))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| anyhow!("{} cannot be used as a base url", settings.api_base))?
            .pop_if_empty()
            .push(&settings.phone_id)
            .push("messages");

        Ok(Self {
            endpoint,
            api_token: settings.api_token.clone(),
            template_name: settings.template_name.clone(),
            language_code: settings.language_code.clone(),
            timezone,
        })
    }

    fn message<'a>(&'a self, notification: &'a Notification) -> TemplateMessage<'a> {
        let schedule = &notification.schedule;
        TemplateMessage {
            messaging_product: "whatsapp",
            to: notification.recipient.phone.as_str(),
            kind: "template",
            template: Template {
                name: &self.template_name,
                language: Language {
                    code: &self.language_code,
                },
                components: vec![Component {
                    kind: "body",
                    parameters: vec![
                        TextParameter::new(schedule.title.to_string()),
                        TextParameter::new(render_schedule_time(
                            &schedule.schedule_time,
                            self.timezone,
                        )),
                    ],
                }],
            },
        }
    }
}

#[async_trait]
impl DeliveryStrategy for WhatsAppStrategy {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    #[tracing::instrument(skip_all, fields(to = %notification.recipient.phone), level = "debug")]
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let bearer_token = format!("Bearer {}", self.api_token.expose_secret());
        let headers = HashMap::from([("authorization", bearer_token)]);
        let body = self.message(notification);

        match HttpClient::post_json::<SentMessages>(self.endpoint.clone(), headers, &body).await {
            Ok(sent) => {
                let ids = sent
                    .messages
                    .into_iter()
                    .map(|message| message.id)
                    .collect::<Vec<_>>();
                tracing::info!(message_ids = ?ids, "WhatsApp message accepted");
                Ok(())
            }
            Err(HttpClientError::UnsuccessfulStatus { status, body, .. }) => {
                let detail = provider_error_message(&body).unwrap_or(body);
                bail!("WhatsApp API rejected the message with {status}: {detail}")
            }
            Err(err) => Err(err).context("Failed to call the WhatsApp API"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::fixtures::notification;
    use chrono_tz::Asia::Jakarta;
    use httpmock::prelude::*;
    use serde_json::json;

    fn settings(api_base: String) -> ChatSettings {
        ChatSettings {
            api_base,
            api_token: Secret::new("token".to_owned()),
            phone_id: "1234567890".to_owned(),
            template_name: "schedule_notification".to_owned(),
            language_code: "en_US".to_owned(),
            broadcast_phone: "6280000000000".to_owned(),
        }
    }

    #[test]
    fn test_endpoint_is_built_under_the_api_base() {
        for base in [
            "https://graph.facebook.com/v18.0",
            "https://graph.facebook.com/v18.0/",
        ] {
            let strategy = WhatsAppStrategy::new(&settings(base.to_owned()), Jakarta).unwrap();
            assert_eq!(
                strategy.endpoint.as_str(),
                "https://graph.facebook.com/v18.0/1234567890/messages"
            );
        }
    }

    #[tokio::test]
    async fn test_template_message_is_posted_with_bearer_token() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v18.0/1234567890/messages")
                    .header("authorization", "Bearer token")
                    .json_body(json!({
                        "messaging_product": "whatsapp",
                        "to": "6281234567890",
                        "type": "template",
                        "template": {
                            "name": "schedule_notification",
                            "language": { "code": "en_US" },
                            "components": [{
                                "type": "body",
                                "parameters": [
                                    { "type": "text", "text": "Standup" },
                                    { "type": "text", "text": "10/01/2025 16:00" }
                                ]
                            }]
                        }
                    }));
                then.status(200)
                    .header("content-type", "application/json")
                    .json_body(json!({ "messages": [{ "id": "wamid.1" }] }));
            })
            .await;

        let strategy = WhatsAppStrategy::new(&settings(server.url("/v18.0")), Jakarta).unwrap();
        strategy.deliver(&notification("Standup")).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_error_message_is_surfaced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v18.0/1234567890/messages");
                then.status(400)
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "error": {
                            "message": "(#131030) Recipient phone number not in allowed list",
                            "code": 131030
                        }
                    }));
            })
            .await;

        let strategy = WhatsAppStrategy::new(&settings(server.url("/v18.0")), Jakarta).unwrap();
        let error = strategy
            .deliver(&notification("Standup"))
            .await
            .unwrap_err()
            .to_string();

        assert!(error.contains("400"));
        assert!(error.contains("Recipient phone number not in allowed list"));
    }

    #[tokio::test]
    async fn test_unavailable_provider_is_called_once() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v18.0/1234567890/messages");
                then.status(503).body("upstream unavailable");
            })
            .await;

        let strategy = WhatsAppStrategy::new(&settings(server.url("/v18.0")), Jakarta).unwrap();
        let error = strategy
            .deliver(&notification("Standup"))
            .await
            .unwrap_err()
            .to_string();

        assert!(error.contains("upstream unavailable"));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[test]
    fn test_unstructured_error_bodies_are_kept_verbatim() {
        assert_eq!(provider_error_message("bad gateway"), None);
    }
}
