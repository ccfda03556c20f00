//! Publishes one notification read as JSON from stdin, e.g.
//! `echo '{"title":"Standup","scheduleTime":"2025-01-10T09:00:00Z"}' | publish`

use anyhow::Context;
use background_workers::app;
use background_workers::configuration::PublisherSettings;
use notifications::event::NotificationMessage;
use notifications::producer::PublishOutcome;
use shared_kernel::tracing::{init_telemetry, shutdown_telemetry};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = PublisherSettings::parse()?;
    init_telemetry(&settings.telemetry)?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read stdin")?;
    let message = serde_json::from_str::<NotificationMessage>(&input)
        .context("stdin is not a notification document")?;

    let publisher = app::publisher(&settings.channel, app::connector(&settings.channel));
    match publisher.publish(&message).await {
        PublishOutcome::Published(id) => println!("published {id}"),
        PublishOutcome::Dropped => println!("dropped, see the logs for the cause"),
    }

    shutdown_telemetry();
    Ok(())
}
