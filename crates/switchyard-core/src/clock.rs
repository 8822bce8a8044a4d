//! Wall-clock helpers in server-local time

use jiff::{Timestamp, Zoned};

const DAY_SECS: i64 = 86_400;

/// Current unix time in seconds
pub fn now_secs() -> i64 {
    Timestamp::now().as_second()
}

/// Unix seconds of the next local midnight
///
/// Daily counters expire here so thresholds reset per calendar day
/// rather than on a sliding window.
pub fn next_midnight() -> i64 {
    let now = Zoned::now();
    now.tomorrow()
        .and_then(|tomorrow| tomorrow.start_of_day())
        .map_or_else(|_| now.timestamp().as_second() + DAY_SECS, |zdt| zdt.timestamp().as_second())
}

/// Local calendar day as `YYYYMMDD`
pub fn day_stamp() -> String {
    Zoned::now().strftime("%Y%m%d").to_string()
}
