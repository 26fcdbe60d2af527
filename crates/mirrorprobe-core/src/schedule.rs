//! Calendar-style schedule specifications.
//!
//! A spec matches wall-clock seconds by second-of-minute and
//! minute-of-hour. An unset `second` means second 0 and an unset `minute`
//! means every minute, so `{ second = [0, 30] }` fires twice a minute and
//! `{ minute = { start = 0, end = 59, step = 10 } }` fires every ten
//! minutes on the minute.

use std::fmt;

use chrono::{DateTime, DurationRound, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Longest gap between two ticks of any valid spec, plus slack.
const SEARCH_HORIZON_SECS: i64 = 2 * 3600;

/// Matcher for a single calendar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    /// Explicit values.
    List(Vec<u32>),
    /// Every `step`-th value from `start` through `end` inclusive.
    Range {
        start: u32,
        end: u32,
        #[serde(default = "default_step")]
        step: u32,
    },
}

fn default_step() -> u32 {
    1
}

impl Field {
    pub fn contains(&self, value: u32) -> bool {
        match self {
            Field::List(values) => values.contains(&value),
            Field::Range { start, end, step } => {
                *step > 0 && value >= *start && value <= *end && (value - start) % step == 0
            }
        }
    }

    fn validate(&self, field: &str) -> CoreResult<()> {
        match self {
            Field::List(values) => {
                if values.is_empty() {
                    return Err(CoreError::InvalidSchedule(format!("{field}: empty list")));
                }
                if let Some(v) = values.iter().find(|v| **v > 59) {
                    return Err(CoreError::InvalidSchedule(format!(
                        "{field}: value {v} out of range 0..=59"
                    )));
                }
            }
            Field::Range { start, end, step } => {
                if *step == 0 {
                    return Err(CoreError::InvalidSchedule(format!("{field}: step must be > 0")));
                }
                if *start > 59 || start > end {
                    return Err(CoreError::InvalidSchedule(format!(
                        "{field}: bad range {start}..={end}"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::List(values) => {
                let parts: Vec<String> = values.iter().map(u32::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
            Field::Range { start, end, step } => write!(f, "{start}-{end}/{step}"),
        }
    }
}

/// When a probe should run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<Field>,
}

impl ScheduleSpec {
    /// Fire every minute at the listed seconds.
    pub fn seconds(values: impl Into<Vec<u32>>) -> Self {
        Self {
            second: Some(Field::List(values.into())),
            minute: None,
        }
    }

    /// Fire on the minute for every `step`-th minute in `start..=end`.
    pub fn minutes(start: u32, end: u32, step: u32) -> Self {
        Self {
            second: None,
            minute: Some(Field::Range { start, end, step }),
        }
    }

    /// Reject specs that could never fire or would fire on invalid values.
    pub fn validate(&self) -> CoreResult<()> {
        if self.second.is_none() && self.minute.is_none() {
            return Err(CoreError::InvalidSchedule(
                "at least one of second/minute must be set".to_string(),
            ));
        }
        if let Some(second) = &self.second {
            second.validate("second")?;
        }
        if let Some(minute) = &self.minute {
            minute.validate("minute")?;
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Whether the whole second `at` matches this spec.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        let second_ok = match &self.second {
            Some(field) => field.contains(at.second()),
            None => at.second() == 0,
        };
        let minute_ok = match &self.minute {
            Some(field) => field.contains(at.minute()),
            None => true,
        };
        second_ok && minute_ok
    }

    /// Next matching whole second strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_valid() {
            return None;
        }
        let base = after.duration_trunc(TimeDelta::seconds(1)).ok()?;
        (1..=SEARCH_HORIZON_SECS)
            .map(|offset| base + TimeDelta::seconds(offset))
            .find(|candidate| self.matches(*candidate))
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let second = self
            .second
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "0".to_string());
        let minute = self
            .minute
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "*".to_string());
        write!(f, "{second} {minute}")
    }
}
