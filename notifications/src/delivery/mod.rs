use crate::event::{Recipient, ScheduleDetails};
use async_trait::async_trait;
use chrono_tz::Tz;
use shared_kernel::date_time::EventTime;

pub mod email;
pub mod whatsapp;

const SCHEDULE_TIME_FORMAT: &str = "%d/%m/%Y %H:%M";

/// A fully resolved notification: who receives it and what it is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: Recipient,
    pub schedule: ScheduleDetails,
}

/// One outbound provider call per notification. Implementations report
/// failures; deciding what a failure means is left to the caller.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

pub(crate) fn render_schedule_time(time: &EventTime, timezone: Tz) -> String {
    match (time.in_timezone(timezone), time) {
        (Some(local), _) => local.format(SCHEDULE_TIME_FORMAT).to_string(),
        (None, EventTime::Floating(wall_clock)) => {
            wall_clock.format(SCHEDULE_TIME_FORMAT).to_string()
        }
        (None, EventTime::Absolute(instant)) => instant.format(SCHEDULE_TIME_FORMAT).to_string(),
    }
}
