//! Time utilities and constants for RateMesh.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine timing constants.
pub mod constants {
    use super::Duration;

    /// Rate cache TTL (2 hours).
    pub fn cache_ttl() -> Duration {
        Duration::hours(2)
    }

    /// Symmetric jitter applied to the cache TTL (10 minutes).
    pub fn cache_jitter() -> Duration {
        Duration::minutes(10)
    }

    /// Default per-provider request timeout (10 seconds).
    pub fn provider_timeout() -> Duration {
        Duration::seconds(10)
    }

    /// How often the monitor checks whether an hour has elapsed (60 seconds).
    pub fn flush_check_interval() -> Duration {
        Duration::seconds(60)
    }
}

/// Retention windows for persisted data.
pub mod retention {
    /// Renewable latest-rate table (7 days).
    pub const RATES_DAYS: i64 = 7;

    /// Append-only rate history (90 days, never less than 30).
    pub const HISTORY_DAYS: i64 = 90;

    /// Minimum allowed history retention.
    pub const MIN_HISTORY_DAYS: i64 = 30;

    /// Hourly statistics (30 days).
    pub const STATS_DAYS: i64 = 30;
}

/// A timestamp with timezone (always UTC for RateMesh).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Current UTC calendar date.
pub fn today() -> NaiveDate {
    now().date_naive()
}

/// Resolve an optional as-of date to a concrete day.
pub fn effective_date(as_of: Option<NaiveDate>) -> NaiveDate {
    as_of.unwrap_or_else(today)
}

/// Check if a timestamp has expired (is in the past).
pub fn is_expired(expiry: Timestamp) -> bool {
    now() >= expiry
}

/// One wall-clock hour, used to key statistics rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HourBucket {
    pub date: NaiveDate,
    /// Hour of day, 0..=23.
    pub hour: u32,
}

impl HourBucket {
    /// Bucket containing the given instant.
    pub fn of(ts: Timestamp) -> Self {
        Self {
            date: ts.date_naive(),
            hour: ts.hour(),
        }
    }

    /// Bucket for the current instant.
    pub fn current() -> Self {
        Self::of(now())
    }
}

impl fmt::Display for HourBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02}:00", self.date, self.hour)
    }
}

/// Duration extensions for convenient construction.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_is_expired() {
        let past = now() - Duration::seconds(10);
        assert!(is_expired(past));

        let future = now() + Duration::seconds(10);
        assert!(!is_expired(future));
    }

    #[test]
    fn test_hour_bucket() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 14, 59, 59).unwrap();
        let bucket = HourBucket::of(ts);
        assert_eq!(bucket.date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(bucket.hour, 14);
        assert_ne!(bucket, HourBucket::of(ts + Duration::seconds(1)));
        assert_eq!(bucket.to_string(), "2024-03-05 14:00");
    }

    #[test]
    fn test_effective_date() {
        let d = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        assert_eq!(effective_date(Some(d)), d);
        assert_eq!(effective_date(None), today());
    }

    #[test]
    fn test_negative_duration_as_std_is_zero() {
        assert_eq!(Duration::seconds(-5).as_std(), std::time::Duration::ZERO);
        assert_eq!(Duration::seconds(5).as_std(), std::time::Duration::from_secs(5));
    }
}
