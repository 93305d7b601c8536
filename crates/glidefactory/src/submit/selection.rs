//! Entry-set multiplexing: splitting one submission across the entry's
//! submit files.

use std::path::Path;

use crate::config::JobDescript;
use crate::queue::status::StatusCounts;
use crate::{Map, Result};
use crate::common::error::FactoryError;

/// Splits a desired submission count across the available submit files.
/// The returned counts must sum to at most `nr_glideins`.
pub trait EntrySelectionAlgorithm {
    fn name(&self) -> &'static str;

    fn select(
        &self,
        submit_files: &[String],
        file_status: &Map<String, StatusCounts>,
        job_descript: &JobDescript,
        nr_glideins: i64,
    ) -> Map<String, i64>;
}

/// Everything goes into the first submit file; the single-file common case.
pub struct DefaultSelection;

impl EntrySelectionAlgorithm for DefaultSelection {
    fn name(&self) -> &'static str {
        "Default"
    }

    fn select(
        &self,
        submit_files: &[String],
        _file_status: &Map<String, StatusCounts>,
        _job_descript: &JobDescript,
        nr_glideins: i64,
    ) -> Map<String, i64> {
        let mut out = Map::new();
        if let Some(first) = submit_files.first() {
            out.insert(first.clone(), nr_glideins);
        }
        out
    }
}

/// Spread pilots one at a time onto the sub-entry with the fewest active
/// (idle + running) pilots, counting this round's assignments.
pub struct LeastLoadedSelection;

impl EntrySelectionAlgorithm for LeastLoadedSelection {
    fn name(&self) -> &'static str {
        "LeastLoaded"
    }

    fn select(
        &self,
        submit_files: &[String],
        file_status: &Map<String, StatusCounts>,
        _job_descript: &JobDescript,
        nr_glideins: i64,
    ) -> Map<String, i64> {
        let mut out: Map<String, i64> = Map::new();
        if submit_files.is_empty() {
            return out;
        }
        let mut load: Vec<(String, i64)> = submit_files
            .iter()
            .map(|f| {
                let counts = file_status.get(f);
                let active = counts.map(|c| c.idle() + c.running()).unwrap_or(0);
                (f.clone(), active)
            })
            .collect();
        for _ in 0..nr_glideins {
            // stable on ties: earliest file wins
            let idx = (0..load.len())
                .min_by_key(|&i| (load[i].1, load[i].0.clone()))
                .expect("submit_files is not empty");
            *out.entry(load[idx].0.clone()).or_insert(0) += 1;
            load[idx].1 += 1;
        }
        out
    }
}

pub fn create_selection_algorithm(name: &str) -> Result<Box<dyn EntrySelectionAlgorithm>> {
    match name {
        "Default" => Ok(Box::new(DefaultSelection)),
        "LeastLoaded" => Ok(Box::new(LeastLoadedSelection)),
        other => Err(FactoryError::ConfigError(format!(
            "unknown EntrySelectionAlgorithm '{other}'"
        ))),
    }
}

/// Submit files of the entry: `entry_<name>/job.*condor`, sorted. Paths are
/// relative to the submit directory, the submit tool's working directory.
pub fn find_submit_files(submit_dir: &Path, entry_name: &str) -> Result<Vec<String>> {
    let entry_dir_name = format!("entry_{entry_name}");
    let entry_dir = submit_dir.join(&entry_dir_name);
    let mut files = Vec::new();
    let listing = std::fs::read_dir(&entry_dir).map_err(|e| {
        FactoryError::GenericError(format!("cannot list {}: {e}", entry_dir.display()))
    })?;
    for item in listing {
        let item = item?;
        let name = item.file_name().to_string_lossy().to_string();
        if name.starts_with("job.") && name.ends_with("condor") {
            files.push(format!("{entry_dir_name}/{name}"));
        }
    }
    files.sort();
    Ok(files)
}
