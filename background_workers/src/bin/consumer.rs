use anyhow::Context;
use background_workers::app;
use background_workers::configuration::Settings;
use shared_kernel::tracing::{init_telemetry, shutdown_telemetry};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    init_telemetry(&settings.telemetry)?;

    let listener = app::listener(&settings.notifications(), app::connector(&settings.channel))?;
    let shutdown = CancellationToken::new();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(err) => tracing::error!(error = ?err, "Failed to listen for Ctrl-C"),
            }
        }
    });

    let result = listener
        .run(shutdown)
        .await
        .context("Notification listener failed");
    shutdown_telemetry();
    result
}
