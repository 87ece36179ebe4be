//! Time buckets and key naming for real-time aggregates and the retry queue.
//!
//! Every aggregate key embeds the calendar bucket it belongs to, so that the
//! key space for a given granularity is bounded by the TTL attached to it:
//!
//! | key                            | granularity | contents                       |
//! |--------------------------------|-------------|--------------------------------|
//! | `stats:hourly:<YYYY-MM-DD-HH>` | hour        | event_type -> count            |
//! | `users:daily:<YYYY-MM-DD>`     | day         | HyperLogLog over `user_id`     |
//! | `failed_events:<YYYYMMDD>`     | day         | list of JSON envelopes         |
//!
//! All buckets are computed in UTC.

use chrono::{DateTime, NaiveDate, Utc};

pub const HOURLY_STATS_PREFIX: &str = "stats:hourly:";
pub const DAILY_USERS_PREFIX: &str = "users:daily:";
pub const FAILED_EVENTS_PREFIX: &str = "failed_events:";

/// Hour-bucketed counter key for the hour containing `timestamp`.
pub fn hourly_stats_key(timestamp: DateTime<Utc>) -> String {
    format!("{}{}", HOURLY_STATS_PREFIX, timestamp.format("%Y-%m-%d-%H"))
}

/// Day-bucketed distinct-user key for the day containing `timestamp`.
pub fn daily_users_key(timestamp: DateTime<Utc>) -> String {
    daily_users_key_for_day(timestamp.date_naive())
}

pub fn daily_users_key_for_day(day: NaiveDate) -> String {
    format!("{}{}", DAILY_USERS_PREFIX, day.format("%Y-%m-%d"))
}

/// Retry list key for the day of a flush attempt made at `now`.
pub fn failed_events_key(now: DateTime<Utc>) -> String {
    failed_events_key_for_day(now.date_naive())
}

pub fn failed_events_key_for_day(day: NaiveDate) -> String {
    format!("{}{}", FAILED_EVENTS_PREFIX, day.format("%Y%m%d"))
}

/// Parses a `YYYYMMDD` retry-day label.
pub fn parse_retry_day(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label, "%Y%m%d").ok()
}
