use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as epoch seconds, the unit used by all queue timestamps.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Today's date as `YYYYMMDD`, used to tag pilot log files.
pub fn today_lognr() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

pub fn days_to_secs(days: i64) -> i64 {
    days * 24 * 3600
}

pub fn hours_to_secs(hours: i64) -> i64 {
    hours * 3600
}
