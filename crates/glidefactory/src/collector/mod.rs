//! Client for the shared collector ("bus"): advertise classad files and
//! query advertisement state.
//!
//! All advertises in the process go through `gfi_advertise.lock` and all
//! queries through `gfi_status.lock`; the collector endpoint serializes
//! commands per process, and the locks also hold across sibling factory
//! processes sharing the lock directory.

pub mod security;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Output;

use bstr::ByteSlice;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::classad::{self, ClassAd};
use crate::common::error::FactoryError;
use crate::common::lock::FileLock;
use crate::Result;
use security::SecEnvRequest;

pub const ADVERTISE_LOCK: &str = "gfi_advertise.lock";
pub const STATUS_LOCK: &str = "gfi_status.lock";

/// Verbs accepted by the advertise tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseCmd {
    UpdateAdGeneric,
    InvalidateAdsGeneric,
    UpdateLicenseAd,
    InvalidateLicenseAds,
}

impl AdvertiseCmd {
    pub fn as_arg(&self) -> &'static str {
        match self {
            AdvertiseCmd::UpdateAdGeneric => "UPDATE_AD_GENERIC",
            AdvertiseCmd::InvalidateAdsGeneric => "INVALIDATE_ADS_GENERIC",
            AdvertiseCmd::UpdateLicenseAd => "UPDATE_LICENSE_AD",
            AdvertiseCmd::InvalidateLicenseAds => "INVALIDATE_LICENSE_ADS",
        }
    }
}

/// Interface to the bus. The subprocess implementation is selected at
/// startup; a library-linked one can slot in behind the same trait.
pub trait BusClient {
    /// Send a classad file under the given verb. `is_multi` marks a file
    /// carrying several blank-line-separated records.
    fn advertise<'a>(
        &'a self,
        fname: &'a Path,
        cmd: AdvertiseCmd,
        is_multi: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

    /// Query advertisements matching `constraint`. When `require_integrity`
    /// is set, channel integrity is demanded before trusting the answer.
    fn query_ads<'a>(
        &'a self,
        constraint: &'a str,
        require_integrity: Option<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>>;
}

/// Environment enforcement is process-global, so every enforce/invoke/restore
/// window runs under this mutex regardless of which lockfile applies.
static ENV_MUTEX: Mutex<()> = Mutex::const_new(());

/// Subprocess-based bus client driving `condor_advertise`/`condor_status`.
pub struct CondorBusClient {
    pool: Option<String>,
    lock_dir: PathBuf,
    use_tcp: bool,
    security: std::sync::Mutex<SecEnvRequest>,
}

impl CondorBusClient {
    pub fn new(pool: Option<String>, lock_dir: PathBuf, use_tcp: bool) -> Self {
        CondorBusClient {
            pool,
            lock_dir,
            use_tcp,
            security: std::sync::Mutex::new(SecEnvRequest::new()),
        }
    }

    pub fn with_security(mut self, security: SecEnvRequest) -> Self {
        self.security = std::sync::Mutex::new(security);
        self
    }

    fn pool_args(&self) -> Vec<String> {
        match &self.pool {
            Some(pool) => vec!["-pool".to_string(), pool.clone()],
            None => vec![],
        }
    }

    async fn run_enforced(&self, mut command: Command, integrity: Option<bool>) -> Result<Output> {
        let _env_guard = ENV_MUTEX.lock().await;
        {
            let mut sec = self.security.lock().unwrap();
            if integrity.is_some() {
                sec.require_integrity(integrity);
            }
            sec.save_state()?;
            sec.enforce_requests();
        }
        let result = command.output().await;
        self.security.lock().unwrap().restore_state();
        result.map_err(|e| FactoryError::BusError(format!("cannot start bus command: {e}")))
    }
}

impl BusClient for CondorBusClient {
    fn advertise<'a>(
        &'a self,
        fname: &'a Path,
        cmd: AdvertiseCmd,
        is_multi: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
        Box::pin(async move {
            let mut command = Command::new("condor_advertise");
            command.args(self.pool_args());
            if self.use_tcp {
                command.arg("-tcp");
            }
            if is_multi {
                command.arg("-multiple");
            }
            command.arg(cmd.as_arg());
            command.arg(fname);

            log::debug!("Advertising {} from {}", cmd.as_arg(), fname.display());
            let lock_path = self.lock_dir.join(ADVERTISE_LOCK);
            let output = {
                let _lock = FileLock::acquire(&lock_path)?;
                self.run_enforced(command, None).await?
            };
            check_command_output(output)
                .map_err(|e| FactoryError::BusError(format!("condor_advertise failed: {e}")))?;
            Ok(())
        })
    }

    fn query_ads<'a>(
        &'a self,
        constraint: &'a str,
        require_integrity: Option<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>> {
        Box::pin(async move {
            let mut command = Command::new("condor_status");
            command.arg("-any");
            command.args(self.pool_args());
            command.arg("-long");
            command.arg("-constraint");
            command.arg(constraint);

            log::debug!("Querying bus with constraint {constraint}");
            let lock_path = self.lock_dir.join(STATUS_LOCK);
            let output = {
                let _lock = FileLock::acquire(&lock_path)?;
                self.run_enforced(command, require_integrity).await?
            };
            let output = check_command_output(output)
                .map_err(|e| FactoryError::QueryError(format!("condor_status failed: {e}")))?;
            let body = output
                .stdout
                .to_str()
                .map_err(|e| FactoryError::QueryError(format!("invalid UTF-8 in query output: {e:?}")))?;
            Ok(classad::parse_records(body))
        })
    }
}

/// Fail on nonzero exit, carrying the tool's stderr/stdout in the message.
pub fn check_command_output(output: Output) -> anyhow::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}
