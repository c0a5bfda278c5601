//! Traversal schedules and their persisted text encoding.
//!
//! A schedule is stored as a single line:
//!
//! ```text
//! ["#"]name:load:retryDelayMillis:start1-end1[:start2-end2...]
//! ```
//!
//! A leading `#` marks the connector as disabled. Older installations wrote
//! the three-field form `name:load:start-end[...]` without a retry delay; such
//! strings still parse and pick up [`default_retry_delay`].

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry delay used when nothing (or nothing usable) is configured.
pub const FALLBACK_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// Environment variable consulted the first time the default is resolved.
pub const RETRY_DELAY_ENV: &str = "HARVEST_RETRY_DELAY_MS";

/// Documents per minute for connectors registered without a schedule.
pub const DEFAULT_LOAD: u32 = 200;

const HOURS_PER_DAY: u8 = 24;

static DEFAULT_RETRY_DELAY: OnceCell<Duration> = OnceCell::new();

/// Process-wide retry delay applied to legacy schedules and non-positive
/// delays. Resolved once; later calls return the cached value.
pub fn default_retry_delay() -> Duration {
    *DEFAULT_RETRY_DELAY.get_or_init(|| {
        let configured = env::var(RETRY_DELAY_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .map(Duration::from_millis);
        sanitize_retry_delay(configured)
    })
}

/// Installs the process-wide default before anything reads it. Returns
/// `false` when the default was already resolved.
pub fn install_default_retry_delay(delay: Duration) -> bool {
    DEFAULT_RETRY_DELAY
        .set(sanitize_retry_delay(Some(delay)))
        .is_ok()
}

fn sanitize_retry_delay(delay: Option<Duration>) -> Duration {
    match delay {
        Some(delay) if delay >= Duration::from_millis(1) => whole_millis(delay),
        _ => FALLBACK_RETRY_DELAY,
    }
}

/// Rounds up to the millisecond precision of the text encoding.
fn whole_millis(delay: Duration) -> Duration {
    let partial = u128::from(delay.subsec_nanos() % 1_000_000 != 0);
    let millis = delay.as_millis().saturating_add(partial);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleParseError {
    #[error("expected at least 3 ':'-separated fields, found {0}")]
    FieldCount(usize),

    #[error("connector name is empty")]
    EmptyName,

    #[error("load is not a non-negative integer: {0:?}")]
    InvalidLoad(String),

    #[error("retry delay is not an integer: {0:?}")]
    InvalidRetryDelay(String),

    #[error("malformed time interval: {0:?}")]
    InvalidInterval(String),

    #[error("hour {0} is outside 0-24")]
    HourOutOfRange(u32),

    #[error("schedule has no time intervals")]
    NoTimeIntervals,
}

/// Half-open `[start, end)` range of hours in local time.
///
/// `start == end` covers the whole day (`0-0` by convention) and
/// `start > end` wraps past midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimeInterval {
    start: u8,
    end: u8,
}

impl TimeInterval {
    pub fn new(start: u32, end: u32) -> Result<Self, ScheduleParseError> {
        Ok(Self {
            start: checked_hour(start)?,
            end: checked_hour(end)?,
        })
    }

    pub const fn all_day() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn start(&self) -> u32 {
        u32::from(self.start)
    }

    pub fn end(&self) -> u32 {
        u32::from(self.end)
    }

    pub fn is_all_day(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, hour: u32) -> bool {
        let (start, end) = (self.start(), self.end());
        if start == end {
            true
        } else if start < end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }
}

fn checked_hour(hour: u32) -> Result<u8, ScheduleParseError> {
    if hour > u32::from(HOURS_PER_DAY) {
        return Err(ScheduleParseError::HourOutOfRange(hour));
    }
    Ok(hour as u8)
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for TimeInterval {
    type Err = ScheduleParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleParseError::InvalidInterval(raw.to_string());
        let (start, end) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u32>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u32>().map_err(|_| invalid())?;
        Self::new(start, end)
    }
}

/// When, how fast, and whether a connector traverses its repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule {
    connector_name: String,
    disabled: bool,
    load: u32,
    retry_delay: Duration,
    time_intervals: Vec<TimeInterval>,
}

impl Schedule {
    /// Builds a schedule. A zero `retry_delay` is replaced by
    /// [`default_retry_delay`]; any other delay is rounded up to whole
    /// milliseconds.
    pub fn new(
        connector_name: impl Into<String>,
        disabled: bool,
        load: u32,
        retry_delay: Duration,
        time_intervals: Vec<TimeInterval>,
    ) -> Result<Self, ScheduleParseError> {
        let connector_name = connector_name.into();
        if connector_name.trim().is_empty() {
            return Err(ScheduleParseError::EmptyName);
        }
        if time_intervals.is_empty() {
            return Err(ScheduleParseError::NoTimeIntervals);
        }
        let retry_delay = if retry_delay.is_zero() {
            default_retry_delay()
        } else {
            whole_millis(retry_delay)
        };
        Ok(Self {
            connector_name,
            disabled,
            load,
            retry_delay,
            time_intervals,
        })
    }

    /// Enabled, all-day schedule with the given load.
    pub fn always(
        connector_name: impl Into<String>,
        load: u32,
    ) -> Result<Self, ScheduleParseError> {
        Self::new(
            connector_name,
            false,
            load,
            default_retry_delay(),
            vec![TimeInterval::all_day()],
        )
    }

    pub fn parse(text: &str) -> Result<Self, ScheduleParseError> {
        text.parse()
    }

    pub fn connector_name(&self) -> &str {
        &self.connector_name
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn load(&self) -> u32 {
        self.load
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn time_intervals(&self) -> &[TimeInterval] {
        &self.time_intervals
    }

    /// True when `hour` (0-23, local time) falls inside any interval.
    pub fn in_window(&self, hour: u32) -> bool {
        self.time_intervals
            .iter()
            .any(|interval| interval.contains(hour))
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.load = load;
        self
    }

    /// Same schedule under a different connector name; used when a
    /// connector is registered with a schedule written for another name.
    pub fn renamed(mut self, connector_name: impl Into<String>) -> Self {
        self.connector_name = connector_name.into();
        self
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.disabled {
            f.write_str("#")?;
        }
        write!(
            f,
            "{}:{}:{}",
            self.connector_name,
            self.load,
            self.retry_delay.as_millis()
        )?;
        for interval in &self.time_intervals {
            write!(f, ":{interval}")?;
        }
        Ok(())
    }
}

impl FromStr for Schedule {
    type Err = ScheduleParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        let (disabled, body) = match text.strip_prefix('#') {
            Some(rest) => (true, rest),
            None => (false, text),
        };

        let fields: Vec<&str> = body.split(':').collect();
        if fields.len() < 3 {
            return Err(ScheduleParseError::FieldCount(fields.len()));
        }

        let connector_name = fields[0].trim();
        if connector_name.is_empty() {
            return Err(ScheduleParseError::EmptyName);
        }

        let load = fields[1]
            .trim()
            .parse::<u32>()
            .map_err(|_| ScheduleParseError::InvalidLoad(fields[1].to_string()))?;

        // The legacy form has an interval where the delay now lives.
        let third = fields[2].trim();
        let legacy = third.contains('-') && third.parse::<i64>().is_err();
        let (retry_delay, interval_fields) = if legacy {
            (default_retry_delay(), &fields[2..])
        } else {
            let millis = third.parse::<i64>().map_err(|_| {
                ScheduleParseError::InvalidRetryDelay(fields[2].to_string())
            })?;
            let delay = if millis > 0 {
                Duration::from_millis(millis as u64)
            } else {
                default_retry_delay()
            };
            (delay, &fields[3..])
        };

        if interval_fields.is_empty() {
            return Err(ScheduleParseError::NoTimeIntervals);
        }
        let time_intervals = interval_fields
            .iter()
            .map(|raw| raw.parse::<TimeInterval>())
            .collect::<Result<Vec<_>, _>>()?;

        Schedule::new(connector_name, disabled, load, retry_delay, time_intervals)
    }
}

impl TryFrom<String> for Schedule {
    type Error = ScheduleParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> Self {
        schedule.to_string()
    }
}
