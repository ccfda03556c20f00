use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Wall-clock layouts accepted when the producer did not send an offset,
/// e.g. the value of an `<input type="datetime-local">` or a SQL DATETIME.
const FLOATING_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// A point in time as producers send it: either an absolute instant, or a
/// local time without offset which only gets pinned down once a timezone is
/// supplied.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventTime {
    Absolute(DateTime<Utc>),
    Floating(NaiveDateTime),
}

impl EventTime {
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if let Ok(date_time) = DateTime::parse_from_rfc3339(value) {
            return Ok(Self::Absolute(date_time.with_timezone(&Utc)));
        }

        FLOATING_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
            .map(Self::Floating)
            .ok_or_else(|| format!("{value:?} is not a recognised date time"))
    }

    /// `None` only for a floating time that does not exist in `timezone`
    /// (skipped by a DST jump).
    pub fn in_timezone(&self, timezone: Tz) -> Option<DateTime<Tz>> {
        match self {
            Self::Absolute(date_time) => Some(date_time.with_timezone(&timezone)),
            Self::Floating(date_time) => timezone.from_local_datetime(date_time).earliest(),
        }
    }
}

impl FromStr for EventTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
