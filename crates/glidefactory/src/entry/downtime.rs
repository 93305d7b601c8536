//! Entry downtime windows.
//!
//! While an entry is in downtime the factory keeps answering requests but
//! stops growing the pilot population: the effective `min_idle` of every
//! request becomes 0. Removal directives keep using the frontend's own
//! floor.

use std::path::Path;

use crate::common::error::FactoryError;
use crate::Result;

/// One downtime window; `end` of `None` means open-ended.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Window {
    start: i64,
    end: Option<i64>,
    /// Entry name or "All".
    entry: String,
}

/// Calendar of downtime windows, read once at startup.
///
/// File lines: `<start_epoch> <end_epoch|None> <entry|All>`; `#` comments.
#[derive(Debug, Clone, Default)]
pub struct DowntimeCalendar {
    windows: Vec<Window>,
}

impl DowntimeCalendar {
    pub fn load(path: &Path) -> Result<DowntimeCalendar> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            FactoryError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut windows = Vec::new();
        for (nr, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [start, end, entry] = fields.as_slice() else {
                return Err(FactoryError::ConfigError(format!(
                    "{}:{}: malformed downtime line '{line}'",
                    path.display(),
                    nr + 1
                )));
            };
            let start = start.parse().map_err(|_| {
                FactoryError::ConfigError(format!("bad downtime start '{start}'"))
            })?;
            let end = match *end {
                "None" => None,
                other => Some(other.parse().map_err(|_| {
                    FactoryError::ConfigError(format!("bad downtime end '{other}'"))
                })?),
            };
            windows.push(Window {
                start,
                end,
                entry: entry.to_string(),
            });
        }
        Ok(DowntimeCalendar { windows })
    }

    pub fn is_in_downtime(&self, entry_name: &str, now: i64) -> bool {
        self.windows.iter().any(|w| {
            (w.entry == "All" || w.entry == entry_name)
                && w.start <= now
                && w.end.is_none_or(|end| now < end)
        })
    }
}
