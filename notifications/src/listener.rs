//! The long-running consumption loop. It owns the channel session and keeps
//! trying to (re)establish it until told to shut down.

use crate::channel::{ChannelConnector, ChannelSession, DeliveryStream, QueueTopology};
use crate::dispatcher::Dispatcher;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_RECONNECT_SECS: u64 = 5;
const MIN_RECONNECT_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    Fixed {
        #[serde(default = "default_reconnect_secs")]
        interval_secs: u64,
    },
    /// Doubles per consecutive failure, capped at `max_secs`.
    Exponential { initial_secs: u64, max_secs: u64 },
}

fn default_reconnect_secs() -> u64 {
    DEFAULT_RECONNECT_SECS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Fixed {
            interval_secs: DEFAULT_RECONNECT_SECS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt, given how many attempts in a row have
    /// already failed (0 for the first retry). Never shorter than a second.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let secs = match *self {
            Self::Fixed { interval_secs } => interval_secs,
            Self::Exponential {
                initial_secs,
                max_secs,
            } => {
                let factor = 1u64.checked_shl(consecutive_failures).unwrap_or(u64::MAX);
                initial_secs.saturating_mul(factor).min(max_secs)
            }
        };
        Duration::from_secs(secs.max(MIN_RECONNECT_SECS))
    }
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub topology: QueueTopology,
    pub prefetch: u16,
    pub max_in_flight: Option<usize>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            topology: QueueTopology::default(),
            prefetch: 0,
            max_in_flight: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

enum SessionEnd {
    Shutdown,
    StreamClosed,
}

pub struct Listener {
    connector: Arc<dyn ChannelConnector>,
    dispatcher: Arc<Dispatcher>,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl Listener {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        dispatcher: Arc<Dispatcher>,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Disconnected);
        Self {
            connector,
            dispatcher,
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Only returns once `shutdown` is cancelled; transport failures are
    /// logged and retried.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut consecutive_failures = 0;
        loop {
            match self.listen(&shutdown).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::StreamClosed) => {
                    warn!("Delivery stream closed, reconnecting");
                    consecutive_failures = 0;
                }
                Err(err) => {
                    error!(error = ?err, "Failed to start listening for notifications");
                }
            }
            self.state.send_replace(ListenerState::Disconnected);

            let delay = self.config.reconnect.delay(consecutive_failures);
            consecutive_failures = consecutive_failures.saturating_add(1);
            info!(delay_secs = delay.as_secs(), "Reconnecting to the message broker");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ListenerState::Disconnected);
        info!("Notification listener stopped");
        Ok(())
    }

    async fn listen(&self, shutdown: &CancellationToken) -> anyhow::Result<SessionEnd> {
        let session = self.connector.connect().await?;
        let deliveries = match self.subscribe(session.as_ref()).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                close(session.as_ref()).await;
                return Err(err);
            }
        };

        self.state.send_replace(ListenerState::Listening);
        info!(queue = %self.config.topology.queue, "Waiting for notifications");

        let dispatcher = self.dispatcher.clone();
        let consume = deliveries.for_each_concurrent(self.config.max_in_flight, move |delivery| {
            let dispatcher = dispatcher.clone();
            async move {
                match delivery {
                    Ok(message) => {
                        dispatcher.handle(message.as_ref()).await;
                    }
                    Err(err) => warn!(error = ?err, "Failed to receive a delivery"),
                }
            }
        });

        let end = tokio::select! {
            _ = shutdown.cancelled() => SessionEnd::Shutdown,
            _ = consume => SessionEnd::StreamClosed,
        };
        close(session.as_ref()).await;
        Ok(end)
    }

    async fn subscribe(&self, session: &dyn ChannelSession) -> anyhow::Result<DeliveryStream> {
        session.declare(&self.config.topology).await?;
        session
            .consume(&self.config.topology, self.config.prefetch)
            .await
    }
}

async fn close(session: &dyn ChannelSession) {
    if let Err(err) = session.close().await {
        warn!(error = ?err, "Failed to close the broker session");
    }
}
