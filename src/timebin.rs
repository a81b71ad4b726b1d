//! Wall-clock alignment of sampling, staging and transfer boundaries.
//!
//! Boundaries are integer multiples of an interval counted from the Unix epoch,
//! so any interval that divides a day lines up with the hour and with midnight
//! UTC, and the same interval yields the same boundaries on every instrument
//! and across restarts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

fn interval_millis(interval: Duration) -> i64 {
    i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// First boundary strictly after `now`, shifted by `offset`.
pub fn next_boundary(now: DateTime<Utc>, interval: Duration, offset: Duration) -> DateTime<Utc> {
    let step = interval_millis(interval);
    let shift = i64::try_from(offset.as_millis()).unwrap_or(0) % step;
    let t = now.timestamp_millis() - shift;
    let next = (t.div_euclid(step) + 1) * step + shift;
    millis_to_utc(next)
}

/// Start of the bin containing `ts`. Bins are half-open `[start, end)`.
pub fn interval_start(ts: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval_millis(interval);
    millis_to_utc(ts.timestamp_millis().div_euclid(step) * step)
}

/// End of the bin containing `ts`.
pub fn interval_end(ts: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    interval_start(ts, interval) + ChronoDuration::milliseconds(interval_millis(interval))
}

/// `YYYYMMDDHHmm` stamp of `end`, truncated to the reporting resolution.
pub fn filename_stamp(end: DateTime<Utc>, reporting_interval: Duration) -> String {
    interval_start(end, reporting_interval)
        .format("%Y%m%d%H%M")
        .to_string()
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
