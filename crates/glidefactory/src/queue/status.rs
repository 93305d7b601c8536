//! Folding of raw pilot status into the compact state set.
//!
//! Idle pilots are split on the grid sub-status:
//!   1001 : unsubmitted
//!   1002 : submitted/pending
//!   1010 : staging in
//!   1100 : other
//!   4010 : staging out
//! Any other job status passes through unchanged.

use crate::config::StaleAges;
use crate::Map;

use super::PilotRecord;

pub const JOB_STATUS_WAIT: i64 = 0;
pub const JOB_STATUS_IDLE: i64 = 1;
pub const JOB_STATUS_RUNNING: i64 = 2;
pub const JOB_STATUS_HELD: i64 = 5;

pub const CODE_IDLE_UNSUBMITTED: i64 = 1001;
pub const CODE_IDLE_SUBMITTED: i64 = 1002;
pub const CODE_IDLE_STAGING: i64 = 1010;
pub const CODE_IDLE_OTHER: i64 = 1100;
pub const CODE_RUNNING: i64 = 2;
pub const CODE_STAGEOUT: i64 = 4010;

const GRID_PENDING: &[&str] = &[
    "PENDING",
    "INLRMS: Q",
    "PREPARED",
    "SUBMITTING",
    "IDLE",
    "SUSPENDED",
    "REGISTERED",
    "INLRMS:Q",
];
const GRID_STAGE_IN: &[&str] = &["STAGE_IN", "PREPARING", "ACCEPTING", "ACCEPTED"];
const GRID_RUNNING: &[&str] = &["ACTIVE", "REALLY-RUNNING", "INLRMS: R", "RUNNING", "INLRMS:R"];
const GRID_STAGE_OUT: &[&str] = &[
    "STAGE_OUT",
    "INLRMS: E",
    "EXECUTED",
    "FINISHING",
    "FINISHED",
    "DONE",
    "COMPLETED",
    "INLRMS:E",
];

/// Fold a queue record into the compact status code.
pub fn hash_status(el: &PilotRecord) -> i64 {
    match el.job_status {
        JOB_STATUS_IDLE => match &el.grid_job_status {
            Some(grid) => {
                let grid = grid.to_uppercase();
                if GRID_PENDING.contains(&grid.as_str()) {
                    CODE_IDLE_SUBMITTED
                } else if GRID_STAGE_IN.contains(&grid.as_str()) {
                    CODE_IDLE_STAGING
                } else {
                    CODE_IDLE_OTHER
                }
            }
            None => CODE_IDLE_UNSUBMITTED,
        },
        JOB_STATUS_RUNNING => match &el.grid_job_status {
            Some(grid) => {
                let grid = grid.to_uppercase();
                if GRID_RUNNING.contains(&grid.as_str()) {
                    CODE_RUNNING
                } else if GRID_STAGE_OUT.contains(&grid.as_str()) {
                    CODE_STAGEOUT
                } else {
                    CODE_IDLE_OTHER
                }
            }
            None => CODE_RUNNING,
        },
        other => other,
    }
}

/// Coarse labels presented to operators and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoarseStatus {
    Wait,
    Idle,
    Running,
    Held,
    Completed,
    Removed,
}

/// Map a folded status code to its coarse label.
pub fn interpret_status(code: i64) -> CoarseStatus {
    match code {
        1000..=1100 | 1 | 17 => CoarseStatus::Idle,
        2 => CoarseStatus::Running,
        4010 => CoarseStatus::Running,
        5 | 12 => CoarseStatus::Held,
        3 | 9 => CoarseStatus::Removed,
        4 => CoarseStatus::Completed,
        _ => CoarseStatus::Wait,
    }
}

/// Counts per folded status code; an immutable snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCounts {
    counts: Map<i64, i64>,
}

impl StatusCounts {
    pub fn from_counts(counts: Map<i64, i64>) -> Self {
        StatusCounts { counts }
    }

    pub fn get(&self, code: i64) -> i64 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    pub fn held(&self) -> i64 {
        self.get(JOB_STATUS_HELD)
    }

    pub fn running(&self) -> i64 {
        self.get(JOB_STATUS_RUNNING)
    }

    /// All idle variants (codes 1000..=1100) plus any plain idle count.
    pub fn idle(&self) -> i64 {
        self.counts
            .iter()
            .filter(|(code, _)| (1000..=1100).contains(*code) || **code == JOB_STATUS_IDLE)
            .map(|(_, n)| n)
            .sum()
    }

    pub fn idle_unsubmitted(&self) -> i64 {
        self.get(CODE_IDLE_UNSUBMITTED)
    }

    /// A new snapshot with the idle variants summed into key 1, the form
    /// published to monitoring. The original snapshot is left untouched.
    pub fn with_summed_idle(&self) -> StatusCounts {
        let mut counts = self.counts.clone();
        counts.insert(JOB_STATUS_IDLE, self.idle());
        StatusCounts { counts }
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }
}

/// Staleness fold: `(job_status, is_stale)`.
pub fn hash_status_stale(el: &PilotRecord, ages: &StaleAges) -> (i64, bool) {
    let age = el.server_time - el.entered_current_status;
    let threshold = match el.job_status {
        JOB_STATUS_IDLE => Some(ages.idle),
        JOB_STATUS_RUNNING => Some(ages.running),
        _ => None,
    };
    match threshold {
        Some(max_age) => (el.job_status, age > max_age),
        None => (el.job_status, false),
    }
}

const EVENT_TRANSITIONAL: &[&str] = &[
    "019", "020", "025", "026", "022", "023", "010", "011", "029", "030",
];
const EVENT_CONNECTION_LOST: &[&str] = &["020", "026", "022", "010", "029"];
const EVENT_ABORT: &[&str] = &["004", "007", "024"];
const EVENT_INFORMATIONAL: &[&str] = &["003", "006", "008", "028"];

/// Merge a 3-digit log event code into the stored one.
///
/// The first digit is a flag counter of pending connection-lost events:
/// a lost event bumps it, the matching reconnect drops it (clamped at 0).
/// Abort events reset to idle-unsubmitted, informational events are no-ops,
/// anything else replaces the stored code outright.
pub fn merge_event(old_status: &str, new_status: &str) -> String {
    if EVENT_TRANSITIONAL.contains(&new_status) {
        let flags: u32 = old_status[..1].parse().unwrap_or(0);
        if EVENT_CONNECTION_LOST.contains(&new_status) {
            format!("{}{}", flags + 1, &old_status[1..])
        } else if flags > 0 {
            // may have already been fixed, out of order events
            format!("{}{}", flags - 1, &old_status[1..])
        } else {
            old_status.to_string()
        }
    } else if EVENT_ABORT.contains(&new_status) {
        "000".to_string()
    } else if EVENT_INFORMATIONAL.contains(&new_status) {
        old_status.to_string()
    } else {
        new_status.to_string()
    }
}
