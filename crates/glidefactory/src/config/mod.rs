//! Typed views of the descript files read once at startup.
//!
//! The descript files are written by the (out-of-scope) configuration tool;
//! this layer only parses and validates them. A schema problem here is fatal
//! at startup and is never raised mid-cycle.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::common::error::FactoryError;
use crate::common::timeutils::{days_to_secs, hours_to_secs};
use crate::{Map, Result};

/// Kind of remote gateway behind an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridType {
    Condor,
    Cream,
    Nordugrid,
    Ec2,
    Gce,
    /// BLAH/BOSCO-style direct batch submission, carrying the LRMS name.
    Batch(String),
}

impl GridType {
    pub fn parse(value: &str) -> Result<GridType> {
        let value = value.trim();
        if let Some(lrms) = value.strip_prefix("batch ") {
            return Ok(GridType::Batch(lrms.trim().to_string()));
        }
        match value {
            "condor" => Ok(GridType::Condor),
            "cream" => Ok(GridType::Cream),
            "nordugrid" => Ok(GridType::Nordugrid),
            "ec2" => Ok(GridType::Ec2),
            "gce" => Ok(GridType::Gce),
            other => Err(FactoryError::ConfigError(format!(
                "unknown grid type '{other}'"
            ))),
        }
    }

    /// Cloud gateways take credentials by value (keys, auth files) rather
    /// than by proxy delegation.
    pub fn is_cloud(&self) -> bool {
        matches!(self, GridType::Ec2 | GridType::Gce)
    }
}

impl fmt::Display for GridType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridType::Condor => f.write_str("condor"),
            GridType::Cream => f.write_str("cream"),
            GridType::Nordugrid => f.write_str("nordugrid"),
            GridType::Ec2 => f.write_str("ec2"),
            GridType::Gce => f.write_str("gce"),
            GridType::Batch(lrms) => write!(f, "batch {lrms}"),
        }
    }
}

/// Per-cycle command pacing and rate caps.
#[derive(Debug, Clone)]
pub struct FactoryTuning {
    pub submit_sleep: f64,
    pub remove_sleep: f64,
    pub release_sleep: f64,
    pub max_submits: i64,
    pub max_cluster_size: i64,
    pub max_removes: usize,
    pub max_releases: usize,
    pub max_release_count: i64,
    pub min_release_time: i64,
}

impl Default for FactoryTuning {
    fn default() -> Self {
        FactoryTuning {
            submit_sleep: 0.2,
            remove_sleep: 0.2,
            release_sleep: 0.2,
            max_submits: 100,
            max_cluster_size: 10,
            max_removes: 5,
            max_releases: 20,
            max_release_count: 10,
            min_release_time: 300,
        }
    }
}

/// Per-status staleness thresholds in seconds.
#[derive(Debug, Clone)]
pub struct StaleAges {
    pub idle: i64,
    pub running: i64,
    /// Kept for the shared policy table; no queue query at this layer emits
    /// the unclaimed pseudo-status.
    pub unclaimed: i64,
}

impl Default for StaleAges {
    fn default() -> Self {
        StaleAges {
            idle: days_to_secs(7),
            running: days_to_secs(31),
            unclaimed: hours_to_secs(2),
        }
    }
}

/// Factory-wide attributes (glidein.descript).
#[derive(Debug, Clone)]
pub struct GlideinDescript {
    pub factory_name: String,
    pub glidein_name: String,
    pub web_url: String,
    pub rsa_key_file: PathBuf,
    pub supported_signtypes: Vec<String>,
    pub advertise_use_tcp: bool,
    pub advertise_use_multi: bool,
    pub factory_collector: Option<String>,
    /// Proxy handed to the collector tools for GSI authentication.
    pub factory_proxy: Option<PathBuf>,
    pub lock_dir: PathBuf,
    pub submit_dir: PathBuf,
    pub client_proxies_base_dir: PathBuf,
    /// Number of factory instances sharing the entries; per-frontend limits
    /// are divided by this.
    pub num_factories: u32,
    pub entries: Vec<String>,
    pub tuning: FactoryTuning,
    pub stale_ages: StaleAges,
}

impl GlideinDescript {
    pub fn load(config_dir: &Path) -> Result<GlideinDescript> {
        let kv = parse_kv_file(&config_dir.join("glidein.descript"))?;
        let d = GlideinDescript {
            factory_name: require(&kv, "FactoryName")?,
            glidein_name: require(&kv, "GlideinName")?,
            web_url: require(&kv, "WebURL")?,
            rsa_key_file: PathBuf::from(optional(&kv, "RSAKeyFile", "rsa.key")),
            supported_signtypes: optional(&kv, "SupportedSignTypes", "sha1")
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            advertise_use_tcp: parse_bool(optional(&kv, "AdvertiseWithTCP", "False"))?,
            advertise_use_multi: parse_bool(optional(&kv, "AdvertiseWithMultiple", "False"))?,
            factory_collector: kv.get("FactoryCollector").cloned(),
            factory_proxy: kv.get("FactoryProxy").map(PathBuf::from),
            lock_dir: PathBuf::from(optional(&kv, "LockDir", ".")),
            submit_dir: PathBuf::from(optional(&kv, "SubmitDir", ".")),
            client_proxies_base_dir: PathBuf::from(require(&kv, "ClientProxiesBaseDir")?),
            num_factories: parse_num(optional(&kv, "NumFactories", "1"))? as u32,
            entries: require(&kv, "Entries")?
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.trim().to_string())
                .collect(),
            tuning: FactoryTuning {
                submit_sleep: parse_float(optional(&kv, "SubmitSleep", "0.2"))?,
                remove_sleep: parse_float(optional(&kv, "RemoveSleep", "0.2"))?,
                release_sleep: parse_float(optional(&kv, "ReleaseSleep", "0.2"))?,
                max_submits: parse_num(optional(&kv, "MaxSubmitsXCycle", "100"))?,
                max_cluster_size: parse_num(optional(&kv, "MaxClusterSize", "10"))?,
                max_removes: parse_num(optional(&kv, "MaxRemovesXCycle", "5"))? as usize,
                max_releases: parse_num(optional(&kv, "MaxReleasesXCycle", "20"))? as usize,
                max_release_count: parse_num(optional(&kv, "MaxReleaseCount", "10"))?,
                min_release_time: parse_num(optional(&kv, "MinReleaseTime", "300"))?,
            },
            stale_ages: StaleAges::default(),
        };
        if d.num_factories == 0 {
            return Err(FactoryError::ConfigError(
                "EntryFractions must be at least 1".to_string(),
            ));
        }
        Ok(d)
    }

    pub fn client_proxies_dir(&self, username: &str) -> PathBuf {
        self.client_proxies_base_dir
            .join(format!("user_{username}"))
            .join(format!("glidein_{}", self.glidein_name))
    }
}

/// Per-entry attributes (entry_<name>/job.descript).
#[derive(Debug, Clone)]
pub struct JobDescript {
    pub entry_name: String,
    pub schedd: String,
    pub grid_type: GridType,
    pub gatekeeper: String,
    /// `+`-separated set, e.g. `grid_proxy` or `key_pair+vm_id`.
    pub auth_method: String,
    pub trust_domain: String,
    pub verbosity: String,
    pub startup_dir: String,
    pub slots_layout: String,
    pub rsl: Option<String>,
    pub proxy_url: Option<String>,
    pub per_entry_max_glideins: i64,
    pub per_entry_max_idle: i64,
    pub per_entry_max_held: i64,
    pub default_fesc_max_glideins: i64,
    pub default_fesc_max_idle: i64,
    pub default_fesc_max_held: i64,
    /// Override strings in `frontend:sec_class;number,...` form.
    pub per_frontend_max_glideins: String,
    pub per_frontend_max_idle: String,
    pub per_frontend_max_held: String,
    /// Hold codes that may be released, `code[:sub|sub...],...` form.
    pub recoverable_hold_codes: String,
    pub selection_algorithm: String,
}

impl JobDescript {
    pub fn load(config_dir: &Path, entry_name: &str) -> Result<JobDescript> {
        let path = config_dir
            .join(format!("entry_{entry_name}"))
            .join("job.descript");
        let kv = parse_kv_file(&path)?;
        Ok(JobDescript {
            entry_name: entry_name.to_string(),
            schedd: require(&kv, "Schedd")?,
            grid_type: GridType::parse(&require(&kv, "GridType")?)?,
            gatekeeper: require(&kv, "Gatekeeper")?,
            auth_method: require(&kv, "AuthMethod")?,
            trust_domain: optional(&kv, "TrustDomain", "Any"),
            verbosity: optional(&kv, "Verbosity", "std"),
            startup_dir: optional(&kv, "StartupDir", "OSG"),
            slots_layout: optional(&kv, "SubmitSlotsLayout", "fixed"),
            rsl: kv.get("GlobusRSL").cloned(),
            proxy_url: kv.get("ProxyURL").cloned(),
            per_entry_max_glideins: parse_num(optional(&kv, "PerEntryMaxGlideins", "10000"))?,
            per_entry_max_idle: parse_num(optional(&kv, "PerEntryMaxIdle", "2000"))?,
            per_entry_max_held: parse_num(optional(&kv, "PerEntryMaxHeld", "1000"))?,
            default_fesc_max_glideins: parse_num(optional(
                &kv,
                "DefaultPerFrontendMaxGlideins",
                "5000",
            ))?,
            default_fesc_max_idle: parse_num(optional(&kv, "DefaultPerFrontendMaxIdle", "100"))?,
            default_fesc_max_held: parse_num(optional(&kv, "DefaultPerFrontendMaxHeld", "50"))?,
            per_frontend_max_glideins: optional(&kv, "PerFrontendMaxGlideins", ""),
            per_frontend_max_idle: optional(&kv, "PerFrontendMaxIdle", ""),
            per_frontend_max_held: optional(&kv, "PerFrontendMaxHeld", ""),
            recoverable_hold_codes: optional(&kv, "RecoverableHoldCodes", ""),
            selection_algorithm: optional(&kv, "EntrySelectionAlgorithm", "Default"),
        })
    }
}

/// Identity and username mapping of the authorized frontends
/// (frontend.descript).
///
/// File format, one mapping per line:
///   `identity <security_name> <bus_identity>`
///   `map <security_name> <security_class> <username>`
#[derive(Debug, Clone, Default)]
pub struct FrontendDescript {
    identities: Map<String, String>,
    usernames: Map<(String, String), String>,
}

impl FrontendDescript {
    pub fn load(config_dir: &Path) -> Result<FrontendDescript> {
        let path = config_dir.join("frontend.descript");
        let body = std::fs::read_to_string(&path).map_err(|e| {
            FactoryError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut out = FrontendDescript::default();
        for (nr, line) in body.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                ["identity", sec_name, identity] => {
                    out.identities
                        .insert(sec_name.to_string(), identity.to_string());
                }
                ["map", sec_name, sec_class, username] => {
                    out.usernames.insert(
                        (sec_name.to_string(), sec_class.to_string()),
                        username.to_string(),
                    );
                }
                _ => {
                    return Err(FactoryError::ConfigError(format!(
                        "{}:{}: unrecognized frontend mapping '{line}'",
                        path.display(),
                        nr + 1
                    )));
                }
            }
        }
        Ok(out)
    }

    pub fn add_identity(&mut self, sec_name: &str, identity: &str) {
        self.identities
            .insert(sec_name.to_string(), identity.to_string());
    }

    pub fn add_username(&mut self, sec_name: &str, sec_class: &str, username: &str) {
        self.usernames.insert(
            (sec_name.to_string(), sec_class.to_string()),
            username.to_string(),
        );
    }

    pub fn get_identity(&self, sec_name: &str) -> Option<&str> {
        self.identities.get(sec_name).map(|s| s.as_str())
    }

    pub fn get_username(&self, sec_name: &str, sec_class: &str) -> Option<&str> {
        self.usernames
            .get(&(sec_name.to_string(), sec_class.to_string()))
            .map(|s| s.as_str())
    }

    /// All known `(security_name, security_class)` pairs.
    pub fn all_frontend_sec_classes(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self.usernames.keys().cloned().collect();
        pairs.sort();
        pairs
    }
}

/// Signature hashes of the staged description files (signatures.sha1).
///
/// Lines of `<sha1_hex> <descript_fname> <id>` where id is `main` or
/// `entry_<name>`.
#[derive(Debug, Clone, Default)]
pub struct SignatureFile {
    pub main_sign: String,
    pub main_descript: String,
    pub(crate) entries: Map<String, (String, String)>,
}

impl SignatureFile {
    pub fn load(config_dir: &Path) -> Result<SignatureFile> {
        let path = config_dir.join("signatures.sha1");
        let body = std::fs::read_to_string(&path).map_err(|e| {
            FactoryError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut out = SignatureFile::default();
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let [sign, descript, id] = fields.as_slice() {
                if *id == "main" {
                    out.main_sign = sign.to_string();
                    out.main_descript = descript.to_string();
                } else if let Some(entry) = id.strip_prefix("entry_") {
                    out.entries
                        .insert(entry.to_string(), (sign.to_string(), descript.to_string()));
                }
            }
        }
        if out.main_sign.is_empty() {
            return Err(FactoryError::ConfigError(format!(
                "{}: missing main signature",
                path.display()
            )));
        }
        Ok(out)
    }

    pub fn add_entry(&mut self, entry: &str, sign: &str, descript: &str) {
        self.entries
            .insert(entry.to_string(), (sign.to_string(), descript.to_string()));
    }

    pub fn entry(&self, entry_name: &str) -> Option<&(String, String)> {
        self.entries.get(entry_name)
    }
}

/// Parse a `Key value...` descript file; first whitespace splits the key.
fn parse_kv_file(path: &Path) -> Result<Map<String, String>> {
    let body = std::fs::read_to_string(path)
        .map_err(|e| FactoryError::ConfigError(format!("cannot read {}: {e}", path.display())))?;
    let mut out = Map::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((key, value)) => {
                out.insert(key.to_string(), value.trim().to_string());
            }
            None => {
                out.insert(line.to_string(), String::new());
            }
        }
    }
    Ok(out)
}

fn require(kv: &Map<String, String>, key: &str) -> Result<String> {
    kv.get(key)
        .cloned()
        .ok_or_else(|| FactoryError::ConfigError(format!("missing descript key '{key}'")))
}

fn optional(kv: &Map<String, String>, key: &str, default: &str) -> String {
    kv.get(key).cloned().unwrap_or_else(|| default.to_string())
}

fn parse_num(value: String) -> Result<i64> {
    value
        .trim()
        .parse()
        .map_err(|_| FactoryError::ConfigError(format!("expected a number, got '{value}'")))
}

fn parse_float(value: String) -> Result<f64> {
    value
        .trim()
        .parse()
        .map_err(|_| FactoryError::ConfigError(format!("expected a number, got '{value}'")))
}

fn parse_bool(value: String) -> Result<bool> {
    match value.trim() {
        "True" | "true" | "1" => Ok(true),
        "False" | "false" | "0" => Ok(false),
        other => Err(FactoryError::ConfigError(format!(
            "expected True/False, got '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_type_parsing() {
        assert_eq!(GridType::parse("condor").unwrap(), GridType::Condor);
        assert_eq!(
            GridType::parse("batch slurm").unwrap(),
            GridType::Batch("slurm".to_string())
        );
        assert!(GridType::parse("teleport").is_err());
        assert!(GridType::Ec2.is_cloud());
        assert!(!GridType::Nordugrid.is_cloud());
    }

    #[test]
    fn descript_files_load() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("glidein.descript"),
            "FactoryName myfactory\nGlideinName v1_0\nWebURL http://web/stage\n\
             ClientProxiesBaseDir /var/lib/gfactory/clientproxies\nEntries osg_test\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("entry_osg_test")).unwrap();
        std::fs::write(
            dir.path().join("entry_osg_test/job.descript"),
            "Schedd schedd_glideins1@host\nGridType condor\n\
             Gatekeeper gk.example.net/jobmanager\nAuthMethod grid_proxy\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("frontend.descript"),
            "identity vofrontend vofrontend@collector.example.net\n\
             map vofrontend frontend fecms\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("signatures.sha1"),
            "abc123 description.cfg main\ndef456 description.cfg entry_osg_test\n",
        )
        .unwrap();

        let glidein = GlideinDescript::load(dir.path()).unwrap();
        assert_eq!(glidein.factory_name, "myfactory");
        assert_eq!(glidein.entries, vec!["osg_test"]);
        assert_eq!(glidein.tuning.max_cluster_size, 10);
        assert_eq!(
            glidein.client_proxies_dir("fecms"),
            PathBuf::from("/var/lib/gfactory/clientproxies/user_fecms/glidein_v1_0")
        );

        let job = JobDescript::load(dir.path(), "osg_test").unwrap();
        assert_eq!(job.grid_type, GridType::Condor);
        assert_eq!(job.selection_algorithm, "Default");

        let frontends = FrontendDescript::load(dir.path()).unwrap();
        assert_eq!(
            frontends.get_username("vofrontend", "frontend"),
            Some("fecms")
        );
        assert_eq!(
            frontends.get_identity("vofrontend"),
            Some("vofrontend@collector.example.net")
        );

        let signatures = SignatureFile::load(dir.path()).unwrap();
        assert_eq!(signatures.main_sign, "abc123");
        assert_eq!(
            signatures.entry("osg_test"),
            Some(&("def456".to_string(), "description.cfg".to_string()))
        );
    }

    #[test]
    fn missing_key_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("glidein.descript"), "FactoryName f\n").unwrap();
        assert!(GlideinDescript::load(dir.path()).is_err());
    }
}
