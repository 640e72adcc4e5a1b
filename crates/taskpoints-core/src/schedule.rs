//! When the daily digest fires.

use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run every N seconds.
    Interval { secs: u64 },
    /// Run once a day at a wall-clock time in the configured offset.
    Daily { hour: u8, min: u8 },
}

impl Schedule {
    pub fn daily_at(time: NaiveTime) -> Self {
        Self::Daily {
            hour: time.hour() as u8,
            min: time.minute() as u8,
        }
    }

    /// First firing strictly after `now`. `None` for an out-of-range
    /// daily time.
    pub fn next_after(&self, now: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        match *self {
            Self::Interval { secs } => Some(now + Duration::seconds(secs.max(1) as i64)),
            Self::Daily { hour, min } => {
                let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(min), 0)?;
                let local_day = now.with_timezone(&offset).date_naive();
                let today = offset
                    .from_local_datetime(&local_day.and_time(time))
                    .single()?
                    .with_timezone(&Utc);
                if today > now {
                    Some(today)
                } else {
                    Some(today + Duration::days(1))
                }
            }
        }
    }
}

/// Calendar day a firing at `at` settles.
pub fn run_day(at: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    at.with_timezone(&offset).date_naive()
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { secs } => write!(f, "every {secs} seconds"),
            Self::Daily { hour, min } => write!(f, "daily at {hour:02}:{min:02}"),
        }
    }
}
