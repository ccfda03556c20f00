use crate::config::{EmailSettings, SmtpSecurity};
use crate::delivery::{render_schedule_time, DeliveryStrategy, Notification};
use crate::event::ScheduleDetails;
use anyhow::Context;
use async_trait::async_trait;
use chrono_tz::Tz;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;

pub struct EmailStrategy {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    timezone: Tz,
}

#[derive(Debug, PartialEq, Eq)]
struct EmailContent {
    subject: String,
    html: String,
}

impl EmailContent {
    fn render(schedule: &ScheduleDetails, timezone: Tz) -> Self {
        let title = schedule.title.as_str();
        let escaped_title = escape_html(title);
        let time = render_schedule_time(&schedule.schedule_time, timezone);
        let html = format!(
            "<h2>New schedule</h2>\
             <p><strong>{escaped_title}</strong></p>\
             <p>Time: {time}</p>"
        );
        Self {
            subject: format!("New schedule: {title}"),
            html,
        }
    }
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for character in value.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

impl EmailStrategy {
    pub fn new(settings: &EmailSettings, timezone: Tz) -> anyhow::Result<Self> {
        let credentials = Credentials::new(
            settings.username.clone(),
            settings.password.expose_secret().clone(),
        );
        let builder = match settings.security {
            SmtpSecurity::ImplicitTls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)
            }
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.smtp_host)
            }
        }
        .with_context(|| format!("Failed to set up SMTP relay {}", settings.smtp_host))?;

        let transport = builder
            .port(settings.smtp_port)
            .credentials(credentials)
            .build();

        let address = settings
            .username
            .parse::<Address>()
            .with_context(|| format!("Invalid sender address {}", settings.username))?;

        Ok(Self {
            transport,
            sender: Mailbox::new(Some(settings.sender_name.clone()), address),
            timezone,
        })
    }

    fn compose(&self, notification: &Notification) -> anyhow::Result<Message> {
        let content = EmailContent::render(&notification.schedule, self.timezone);
        Message::builder()
            .from(self.sender.clone())
            .to(Mailbox::new(
                None,
                notification.recipient.email.address().clone(),
            ))
            .subject(content.subject)
            .header(ContentType::TEXT_HTML)
            .body(content.html)
            .context("Failed to build the notification email")
    }
}

#[async_trait]
impl DeliveryStrategy for EmailStrategy {
    fn name(&self) -> &'static str {
        "email"
    }

    #[tracing::instrument(skip_all, fields(to = %notification.recipient.email), level = "debug")]
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let message = self.compose(notification)?;
        let response = self
            .transport
            .send(message)
            .await
            .context("SMTP server did not accept the notification email")?;
        tracing::info!(code = %response.code(), "Notification email sent");
        Ok(())
    }
}
