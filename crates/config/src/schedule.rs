//! Schedule window configuration and wall-clock helpers

use crate::config::ValidationError;
use chrono::{NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Wall-clock format accepted for `start_time` / `end_time`
pub const CLOCK_FORMAT: &str = "%H:%M";

/// Time-of-day / day-of-week window during which automatic encoding is permitted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Master switch; when false the scheduler never changes the pool mode
    #[serde(default)]
    pub enabled: bool,
    /// Weekday indices, 0 = Monday ... 6 = Sunday
    #[serde(default = "default_days_of_week")]
    pub days_of_week: BTreeSet<u8>,
    /// Window start, local wall-clock `HH:MM` (inclusive)
    #[serde(default = "default_start_time")]
    pub start_time: String,
    /// Window end, local wall-clock `HH:MM` (exclusive); wraps past midnight when before start
    #[serde(default = "default_end_time")]
    pub end_time: String,
    /// `local`, `UTC` or an IANA zone name such as `Europe/Berlin`
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Set by an explicit "start now", cleared only by an explicit "stop now"
    #[serde(default)]
    pub manual_override: bool,
}

fn default_days_of_week() -> BTreeSet<u8> {
    (0..=6).collect()
}

fn default_start_time() -> String {
    "22:00".to_string()
}

fn default_end_time() -> String {
    "06:00".to_string()
}

fn default_timezone() -> String {
    "local".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            days_of_week: default_days_of_week(),
            start_time: default_start_time(),
            end_time: default_end_time(),
            timezone: default_timezone(),
            manual_override: false,
        }
    }
}

impl ScheduleConfig {
    /// Validate times, weekdays and timezone
    ///
    /// An empty day set is only rejected while the schedule is enabled.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(day) = self.days_of_week.iter().find(|&&d| d > 6) {
            return Err(ValidationError::InvalidWeekday(*day));
        }
        if self.enabled && self.days_of_week.is_empty() {
            return Err(ValidationError::EmptyDaySet);
        }
        for (field, value) in [("start_time", &self.start_time), ("end_time", &self.end_time)] {
            if parse_clock_time(value).is_none() {
                return Err(ValidationError::InvalidTime {
                    field,
                    value: value.clone(),
                });
            }
        }
        if ScheduleTimezone::parse(&self.timezone).is_none() {
            return Err(ValidationError::UnknownTimezone(self.timezone.clone()));
        }
        Ok(())
    }
}

/// Parse a strict `HH:MM` wall-clock time
pub fn parse_clock_time(value: &str) -> Option<NaiveTime> {
    let bytes = value.as_bytes();
    if bytes.len() != 5 || bytes[2] != b':' {
        return None;
    }
    NaiveTime::parse_from_str(value, CLOCK_FORMAT).ok()
}

/// Resolved timezone of a schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleTimezone {
    /// Host local time
    Local,
    /// Named IANA zone
    Named(Tz),
}

impl ScheduleTimezone {
    /// Resolve a timezone identifier; empty or `local` means host local time
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("local") {
            return Some(Self::Local);
        }
        value.parse::<Tz>().ok().map(Self::Named)
    }

    /// Current wall-clock time in this zone
    pub fn now(&self) -> NaiveDateTime {
        match self {
            Self::Local => chrono::Local::now().naive_local(),
            Self::Named(tz) => Utc::now().with_timezone(tz).naive_local(),
        }
    }
}
