//! Pilot submission: batching, gateway invocation and output parsing.

pub mod env;
pub mod selection;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use regex::Regex;

use crate::common::error::FactoryError;
use crate::config::{FactoryTuning, GlideinDescript, JobDescript, SignatureFile};
use crate::creds::SubmitCredentials;
use crate::entry::reconcile::PilotSubmitter;
use crate::queue::status::StatusCounts;
use crate::schedd::ScheddClient;
use crate::{JobId, Map, Result};
use env::ClientWeb;
use selection::EntrySelectionAlgorithm;

/// Parse the submit tool's `N job(s) submitted to cluster M.` line.
pub fn extract_job_id(submit_out: &str) -> Result<(i64, i64)> {
    let re = Regex::new(r"^(\d+) job\(s\) submitted to cluster (\d+)\.$").expect("static regex");
    for line in submit_out.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            let count = caps[1].parse().map_err(|_| {
                FactoryError::GenericError("submit count does not fit an integer".to_string())
            })?;
            let cluster = caps[2].parse().map_err(|_| {
                FactoryError::GenericError("cluster id does not fit an integer".to_string())
            })?;
            return Ok((cluster, count));
        }
    }
    Err(FactoryError::GenericError(
        "Could not find cluster info!".to_string(),
    ))
}

fn factory_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| std::env::var("USER").unwrap_or_default())
}

/// One request's submission context; implements the reconciler's submit
/// hook.
pub struct GlideinSubmitter<'a> {
    pub glidein: &'a GlideinDescript,
    pub job: &'a JobDescript,
    pub signatures: &'a SignatureFile,
    pub tuning: &'a FactoryTuning,
    pub schedd: &'a dyn ScheddClient,
    pub selection: &'a dyn EntrySelectionAlgorithm,
    pub client_name: &'a str,
    /// `sec_name:sec_class` tag stamped on the pilots.
    pub frontend_name: &'a str,
    pub submit_credentials: &'a SubmitCredentials,
    pub client_web: Option<&'a ClientWeb>,
    pub params: &'a Map<String, String>,
    pub idle_lifetime: i64,
    /// Folded status per submit file, from this cycle's queue snapshot.
    pub file_status: &'a Map<String, StatusCounts>,
}

impl GlideinSubmitter<'_> {
    /// Submit `nr_glideins` pilots, splitting across submit files per the
    /// selection algorithm and batching each file into clusters of at most
    /// `max_cluster_size`.
    ///
    /// On failure the error carries every `(cluster, proc)` pair that made
    /// it into the queue before the failing invocation.
    pub async fn submit_glideins(&self, nr_glideins: i64) -> Result<Vec<JobId>> {
        let exe_env = env::get_submit_environment(
            self.glidein,
            self.job,
            self.signatures,
            self.client_name,
            self.submit_credentials,
            self.client_web,
            self.params,
            self.idle_lifetime,
        )
        .map_err(|e| {
            log::error!("Failed to setup execution environment: {e}");
            FactoryError::SubmitError {
                submitted: vec![],
                reason: format!("Failed to setup execution environment: {e}"),
            }
        })?;

        let submit_files =
            selection::find_submit_files(&self.glidein.submit_dir, &self.job.entry_name)?;
        if submit_files.is_empty() {
            return Err(FactoryError::SubmitError {
                submitted: vec![],
                reason: format!("no submit files for entry {}", self.job.entry_name),
            });
        }

        let split = if self.selection.name() == "Default" {
            let mut out = Map::new();
            out.insert(submit_files[0].clone(), nr_glideins);
            out
        } else {
            self.selection
                .select(&submit_files, self.file_status, self.job, nr_glideins)
        };
        let mut split: Vec<(String, i64)> = split.into_iter().filter(|(_, n)| *n > 0).collect();
        split.sort();

        let mut submitted_jids: Vec<JobId> = Vec::new();
        let result = self.submit_split(&split, &exe_env, &mut submitted_jids).await;

        log::info!(
            "Submitted {} glideins to {}: {:?}",
            submitted_jids.len(),
            self.job.schedd,
            submitted_jids
        );

        match result {
            Ok(()) => Ok(submitted_jids),
            Err(reason) => Err(FactoryError::SubmitError {
                submitted: submitted_jids,
                reason,
            }),
        }
    }

    async fn submit_split(
        &self,
        split: &[(String, i64)],
        exe_env: &[(String, String)],
        submitted_jids: &mut Vec<JobId>,
    ) -> std::result::Result<(), String> {
        let username = &self.submit_credentials.username;
        let pass_parent_env = *username != factory_username();

        let mut nr_submitted_total = 0i64;
        for (submit_file, nr_glideins) in split {
            let mut nr_submitted = 0i64;
            while nr_submitted < *nr_glideins {
                if nr_submitted_total != 0 {
                    tokio::time::sleep(Duration::from_secs_f64(self.tuning.submit_sleep)).await;
                }
                let nr_to_submit =
                    (*nr_glideins - nr_submitted).min(self.tuning.max_cluster_size);

                let mut cluster_env = exe_env.to_vec();
                cluster_env.push(("GLIDEIN_COUNT".to_string(), nr_to_submit.to_string()));
                cluster_env.push((
                    "GLIDEIN_FRONTEND_NAME".to_string(),
                    self.frontend_name.to_string(),
                ));
                cluster_env.push((
                    "GLIDEIN_ENTRY_SUBMIT_FILE".to_string(),
                    submit_file.clone(),
                ));
                if pass_parent_env {
                    cluster_env.extend(env::parent_env_allowlist());
                }

                let submit_out = self
                    .schedd
                    .submit(&self.job.schedd, submit_file, cluster_env)
                    .await
                    .map_err(|e| format!("condor_submit failed: {e}"))?;

                let (cluster, count) =
                    extract_job_id(&submit_out).map_err(|e| e.to_string())?;
                for j in 0..count {
                    submitted_jids.push((cluster, j));
                }
                nr_submitted += count;
                nr_submitted_total += count;
            }
        }
        Ok(())
    }
}

impl PilotSubmitter for GlideinSubmitter<'_> {
    fn submit<'a>(
        &'a self,
        nr_glideins: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobId>>> + 'a>> {
        Box::pin(self.submit_glideins(nr_glideins))
    }
}
