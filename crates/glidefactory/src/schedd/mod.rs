//! Commands against the local schedd holding the factory's pilots.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use bstr::ByteSlice;
use tokio::process::Command;

use crate::classad::{self, ClassAd};
use crate::collector::check_command_output;
use crate::common::error::FactoryError;
use crate::{JobId, Result};

/// Interface to the local queue manager. The controller and the sanitizer
/// only talk to this trait; tests plug in a recording mock.
pub trait ScheddClient {
    /// Fetch the attribute records of jobs matching `constraint`.
    fn query_queue<'a>(
        &'a self,
        schedd_name: &'a str,
        constraint: &'a str,
        attrs: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>>;

    /// Run the submit tool on `submit_file` with the prepared environment;
    /// returns raw stdout for the caller to parse.
    fn submit<'a>(
        &'a self,
        schedd_name: &'a str,
        submit_file: &'a str,
        env: Vec<(String, String)>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + 'a>>;

    /// Remove one job; `force_x` issues the X-state variant that evicts a
    /// job stuck in removal.
    fn remove_job<'a>(
        &'a self,
        schedd_name: &'a str,
        job: JobId,
        force_x: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

    /// Release one held job.
    fn release_job<'a>(
        &'a self,
        schedd_name: &'a str,
        job: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>>;
}

/// Subprocess implementation driving the HTCondor command line tools.
pub struct CondorScheddClient {
    /// Working directory for the submit tool; submit files are relative
    /// to it.
    submit_dir: PathBuf,
}

impl CondorScheddClient {
    pub fn new(submit_dir: PathBuf) -> Self {
        CondorScheddClient { submit_dir }
    }
}

fn job_spec(job: JobId) -> String {
    format!("{}.{}", job.0, job.1)
}

impl ScheddClient for CondorScheddClient {
    fn query_queue<'a>(
        &'a self,
        schedd_name: &'a str,
        constraint: &'a str,
        attrs: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>> {
        Box::pin(async move {
            let mut command = Command::new("condor_q");
            command.arg("-name").arg(schedd_name);
            command.arg("-constraint").arg(constraint);
            command.arg("-long");
            command.arg("-attributes").arg(attrs.join(","));

            let output = command
                .output()
                .await
                .map_err(|e| FactoryError::QueryError(format!("cannot start condor_q: {e}")))?;
            let output = check_command_output(output)
                .map_err(|e| FactoryError::QueryError(format!("condor_q failed: {e}")))?;
            let body = output.stdout.to_str().map_err(|e| {
                FactoryError::QueryError(format!("invalid UTF-8 in condor_q output: {e:?}"))
            })?;
            Ok(classad::parse_records(body))
        })
    }

    fn submit<'a>(
        &'a self,
        schedd_name: &'a str,
        submit_file: &'a str,
        env: Vec<(String, String)>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + 'a>> {
        Box::pin(async move {
            let mut command = Command::new("condor_submit");
            command.arg("-name").arg(schedd_name);
            command.arg(submit_file);
            command.current_dir(&self.submit_dir);
            command.envs(env);

            log::debug!("Running condor_submit -name {schedd_name} {submit_file}");
            let output = command.output().await.map_err(|e| {
                FactoryError::GenericError(format!("cannot start condor_submit: {e}"))
            })?;
            let output = check_command_output(output)
                .map_err(|e| FactoryError::GenericError(format!("condor_submit failed: {e}")))?;
            let stdout = output.stdout.to_str().map_err(|e| {
                FactoryError::GenericError(format!("invalid UTF-8 in condor_submit output: {e:?}"))
            })?;
            Ok(stdout.to_string())
        })
    }

    fn remove_job<'a>(
        &'a self,
        schedd_name: &'a str,
        job: JobId,
        force_x: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            let mut command = Command::new("condor_rm");
            command.arg("-name").arg(schedd_name);
            if force_x {
                command.arg("-forcex");
            }
            command.arg(job_spec(job));

            let output = command
                .output()
                .await
                .map_err(|e| FactoryError::GenericError(format!("cannot start condor_rm: {e}")))?;
            check_command_output(output)
                .map_err(|e| FactoryError::GenericError(format!("condor_rm failed: {e}")))?;
            Ok(())
        })
    }

    fn release_job<'a>(
        &'a self,
        schedd_name: &'a str,
        job: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            let mut command = Command::new("condor_release");
            command.arg("-name").arg(schedd_name);
            command.arg(job_spec(job));

            let output = command.output().await.map_err(|e| {
                FactoryError::GenericError(format!("cannot start condor_release: {e}"))
            })?;
            check_command_output(output)
                .map_err(|e| FactoryError::GenericError(format!("condor_release failed: {e}")))?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub mod mock {
    //! Recording mock used by the reconciler, sanitizer and submitter tests.

    use std::cell::RefCell;

    use super::*;
    use crate::Map;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ScheddAction {
        Remove { job: JobId, force_x: bool },
        Release { job: JobId },
        Submit { submit_file: String },
    }

    #[derive(Default)]
    pub struct MockSchedd {
        pub actions: RefCell<Vec<ScheddAction>>,
        /// stdout per submit invocation, consumed in order; when exhausted
        /// the submit fails.
        pub submit_outputs: RefCell<Vec<String>>,
        /// captured environment of each submit invocation
        pub submit_envs: RefCell<Vec<Map<String, String>>>,
    }

    impl MockSchedd {
        pub fn with_submit_outputs(outputs: Vec<String>) -> Self {
            MockSchedd {
                submit_outputs: RefCell::new(outputs),
                ..Default::default()
            }
        }

        pub fn removed_jobs(&self) -> Vec<JobId> {
            self.actions
                .borrow()
                .iter()
                .filter_map(|a| match a {
                    ScheddAction::Remove { job, .. } => Some(*job),
                    _ => None,
                })
                .collect()
        }

        pub fn released_jobs(&self) -> Vec<JobId> {
            self.actions
                .borrow()
                .iter()
                .filter_map(|a| match a {
                    ScheddAction::Release { job } => Some(*job),
                    _ => None,
                })
                .collect()
        }
    }

    impl ScheddClient for MockSchedd {
        fn query_queue<'a>(
            &'a self,
            _schedd_name: &'a str,
            _constraint: &'a str,
            _attrs: &'a [&'a str],
        ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>> {
            Box::pin(async move { Ok(vec![]) })
        }

        fn submit<'a>(
            &'a self,
            _schedd_name: &'a str,
            submit_file: &'a str,
            env: Vec<(String, String)>,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + 'a>> {
            Box::pin(async move {
                self.actions.borrow_mut().push(ScheddAction::Submit {
                    submit_file: submit_file.to_string(),
                });
                self.submit_envs
                    .borrow_mut()
                    .push(env.into_iter().collect());
                let mut outputs = self.submit_outputs.borrow_mut();
                if outputs.is_empty() {
                    Err(FactoryError::GenericError("submit refused".to_string()))
                } else {
                    Ok(outputs.remove(0))
                }
            })
        }

        fn remove_job<'a>(
            &'a self,
            _schedd_name: &'a str,
            job: JobId,
            force_x: bool,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
            Box::pin(async move {
                self.actions
                    .borrow_mut()
                    .push(ScheddAction::Remove { job, force_x });
                Ok(())
            })
        }

        fn release_job<'a>(
            &'a self,
            _schedd_name: &'a str,
            job: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
            Box::pin(async move {
                self.actions.borrow_mut().push(ScheddAction::Release { job });
                Ok(())
            })
        }
    }
}
