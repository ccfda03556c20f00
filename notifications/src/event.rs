//! The notification payload travelling through the queue, and the validated
//! event the dispatcher works with.
//!
//! [`NotificationMessage`] mirrors the JSON document so that a
//! publish/consume round trip never drops a field; [`NotificationEvent`] is
//! what that document means once it has been checked.

use lettre::Address;
use serde::{Deserialize, Serialize};
use shared_kernel::date_time::EventTime;
use shared_kernel::non_empty_string;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

non_empty_string!(ScheduleTitle);

#[derive(Debug, Error)]
pub enum EventError {
    #[error("message body is not a notification document: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("targeted notification is missing {0}")]
    MissingRecipient(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// A new schedule was created; recipients come from configuration.
    Broadcast,
    /// A specific user was invited; recipients travel inside the message.
    Targeted,
}

/// Ids are numeric when they come from an auto-increment column but some
/// producers send them as strings. Any JSON number is kept as written, so
/// unsigned, out-of-range and fractional ids still decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Number(serde_json::Number),
    Text(String),
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityId::Number(id) => write!(f, "{id}"),
            EntityId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Number(id.into())
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::Text(id.to_owned())
    }
}

/// The schedule fields every notification carries, as the producer knows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    pub schedule_id: Option<EntityId>,
    pub title: String,
    pub schedule_time: String,
    pub created_by: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<NotificationKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<EntityId>,
    #[serde(alias = "scheduleTitle")]
    pub title: String,
    pub schedule_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_phone: Option<String>,
}

impl NotificationMessage {
    pub fn broadcast(schedule: ScheduleSnapshot) -> Self {
        Self {
            kind: Some(NotificationKind::Broadcast),
            schedule_id: schedule.schedule_id,
            title: schedule.title,
            schedule_time: schedule.schedule_time,
            created_by: schedule.created_by,
            recipient_email: None,
            recipient_phone: None,
        }
    }

    pub fn targeted(schedule: ScheduleSnapshot, email: String, phone: String) -> Self {
        Self {
            kind: Some(NotificationKind::Targeted),
            recipient_email: Some(email),
            recipient_phone: Some(phone),
            ..Self::broadcast(schedule)
        }
    }

    /// Messages written before `kind` existed are targeted exactly when they
    /// name a recipient.
    pub fn kind(&self) -> NotificationKind {
        self.kind.unwrap_or(
            if self.recipient_email.is_some() || self.recipient_phone.is_some() {
                NotificationKind::Targeted
            } else {
                NotificationKind::Broadcast
            },
        )
    }

    /// `kind` is always written, inferred when the document had none.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&Self {
            kind: Some(self.kind()),
            ..self.clone()
        })
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress(Address);

impl EmailAddress {
    pub fn address(&self) -> &Address {
        &self.0
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for EmailAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_str(s.trim())
            .map(EmailAddress)
            .map_err(|err| format!("{s:?} is not an email address: {err}"))
    }
}

/// Digits only, country code first, which is the shape the WhatsApp Cloud
/// API expects in `to`. Spaces, dashes, parentheses and a leading `+` are
/// stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PhoneNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PhoneNumber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);
        let digits: String = trimmed
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();

        if digits.len() < 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("{s:?} is not a phone number"));
        }
        Ok(PhoneNumber(digits))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDetails {
    pub schedule_id: Option<EntityId>,
    pub title: ScheduleTitle,
    pub schedule_time: EventTime,
    pub created_by: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: EmailAddress,
    pub phone: PhoneNumber,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    Broadcast(ScheduleDetails),
    Targeted {
        schedule: ScheduleDetails,
        recipient: Recipient,
    },
}

impl NotificationEvent {
    pub fn decode(body: &[u8]) -> Result<Self, EventError> {
        NotificationMessage::from_bytes(body)?.try_into()
    }

    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationEvent::Broadcast(_) => NotificationKind::Broadcast,
            NotificationEvent::Targeted { .. } => NotificationKind::Targeted,
        }
    }

    pub fn schedule(&self) -> &ScheduleDetails {
        match self {
            NotificationEvent::Broadcast(schedule) => schedule,
            NotificationEvent::Targeted { schedule, .. } => schedule,
        }
    }
}

impl TryFrom<NotificationMessage> for NotificationEvent {
    type Error = EventError;

    fn try_from(message: NotificationMessage) -> Result<Self, Self::Error> {
        let kind = message.kind();
        let title = ScheduleTitle::try_from(message.title).map_err(|reason| {
            EventError::InvalidField {
                field: "title",
                reason,
            }
        })?;
        let schedule_time =
            EventTime::parse(&message.schedule_time).map_err(|reason| EventError::InvalidField {
                field: "scheduleTime",
                reason,
            })?;

        let schedule = ScheduleDetails {
            schedule_id: message.schedule_id,
            title,
            schedule_time,
            created_by: message.created_by,
        };

        match kind {
            NotificationKind::Broadcast => Ok(NotificationEvent::Broadcast(schedule)),
            NotificationKind::Targeted => {
                let email = message
                    .recipient_email
                    .filter(|email| !email.trim().is_empty())
                    .ok_or(EventError::MissingRecipient("recipientEmail"))?
                    .parse::<EmailAddress>()
                    .map_err(|reason| EventError::InvalidField {
                        field: "recipientEmail",
                        reason,
                    })?;
                let phone = message
                    .recipient_phone
                    .filter(|phone| !phone.trim().is_empty())
                    .ok_or(EventError::MissingRecipient("recipientPhone"))?
                    .parse::<PhoneNumber>()
                    .map_err(|reason| EventError::InvalidField {
                        field: "recipientPhone",
                        reason,
                    })?;

                Ok(NotificationEvent::Targeted {
                    schedule,
                    recipient: Recipient { email, phone },
                })
            }
        }
    }
}
