//! Recurrence rules for scheduled workflows.
//!
//! Advancing a date uses calendar arithmetic: "daily, interval 2" moves to
//! the same wall time two calendar days later, and monthly steps clamp to
//! the last day of shorter months.

use crate::error::FlowError;
use chrono::{DateTime, Days, Months, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unit of a recurring schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    /// Adds `interval` units of this frequency to `from`.
    ///
    /// Returns `None` on calendar overflow.
    pub fn advance(&self, from: DateTime<Utc>, interval: u32) -> Option<DateTime<Utc>> {
        match self {
            Frequency::Hourly => {
                let delta = TimeDelta::try_hours(i64::from(interval))?;
                from.checked_add_signed(delta)
            }
            Frequency::Daily => from.checked_add_days(Days::new(u64::from(interval))),
            Frequency::Weekly => from.checked_add_days(Days::new(u64::from(interval) * 7)),
            Frequency::Monthly => from.checked_add_months(Months::new(interval)),
            Frequency::Yearly => from.checked_add_months(Months::new(interval.checked_mul(12)?)),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frequency::Hourly => "hourly",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

/// A recurrence rule: every `interval` units of `frequency`, optionally
/// bounded by a start and end date.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub frequency: Frequency,
    pub interval: u32,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(frequency: Frequency, interval: u32) -> Self {
        Self {
            frequency,
            interval,
            start_date: None,
            end_date: None,
        }
    }

    /// First execution happens at `start`.
    pub fn starting(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    /// No execution happens after `end`.
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    /// Rejects a zero interval and an end date before the start date.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.interval == 0 {
            return Err(FlowError::InvalidSchedule(
                "interval must be at least 1".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(FlowError::InvalidSchedule(format!(
                    "end date {} is before start date {}",
                    end, start
                )));
            }
        }
        Ok(())
    }

    /// Date following `from` under this rule.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.frequency.advance(from, self.interval)
    }

    /// First execution date for a schedule registered at `now`.
    ///
    /// Without a start date the first run is one interval after `now`.
    pub fn first_execution(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.start_date {
            Some(start) => Some(start),
            None => self.next_after(now),
        }
    }

    /// Returns true if `date` lies past the end date.
    pub fn is_expired_at(&self, date: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| date > end)
    }
}
