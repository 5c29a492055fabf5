//! Sampling windows and the cadences the upstream service materializes.

use chrono::{DateTime, Duration, Utc};

/// Request tag marking an hourly-resolution series.
pub const HOURLY_TAG: &str = "resolution:hourly";

/// Request tag marking a daily-resolution series.
pub const DAILY_TAG: &str = "resolution:daily";

/// Sampling cadences the upstream service is known to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// One sample per hour.
    Hourly,
    /// One sample per four hours.
    FourHourly,
    /// One sample per day.
    Daily,
    /// One sample per week.
    Weekly,
}

impl Resolution {
    /// All supported cadences, coarsest last.
    pub const ALL: [Resolution; 4] = [
        Resolution::Hourly,
        Resolution::FourHourly,
        Resolution::Daily,
        Resolution::Weekly,
    ];

    /// Width of one sample step in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Resolution::Hourly => 3_600,
            Resolution::FourHourly => 14_400,
            Resolution::Daily => 86_400,
            Resolution::Weekly => 604_800,
        }
    }

    /// Request tag reserved for this cadence, where one exists.
    ///
    /// Only hourly and daily series take part in stitching, so only those
    /// two carry tags.
    pub fn tag(self) -> Option<&'static str> {
        match self {
            Resolution::Hourly => Some(HOURLY_TAG),
            Resolution::Daily => Some(DAILY_TAG),
            Resolution::FourHourly | Resolution::Weekly => None,
        }
    }
}

/// A bounded sampling window. Invariant: `start < end` (the store enforces
/// this with a CHECK constraint; in-process constructors return `None` when
/// it does not hold).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    /// Inclusive start of the window.
    pub start: DateTime<Utc>,
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build a window, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// Build a window from unix-second bounds as stored in the database.
    pub fn from_unix(start: i64, end: i64) -> Option<Self> {
        Self::new(
            DateTime::from_timestamp(start, 0)?,
            DateTime::from_timestamp(end, 0)?,
        )
    }

    /// Window length in whole seconds.
    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }

    /// Render the window the way fetch scripts expect it on their command
    /// line: day precision beyond seven days, hour precision otherwise.
    pub fn format_for_fetch(&self) -> String {
        if self.end - self.start > Duration::days(7) {
            format!(
                "{} {}",
                self.start.format("%Y-%m-%d"),
                self.end.format("%Y-%m-%d")
            )
        } else {
            format!(
                "{} {}",
                self.start.format("%Y-%m-%dT%H"),
                self.end.format("%Y-%m-%dT%H")
            )
        }
    }
}
