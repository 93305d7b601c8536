//! Per-entry controller: one reconciliation cycle over requests, queue and
//! advertisements.

pub mod downtime;
pub mod reconcile;
pub mod sanitize;
pub mod totals;
pub mod work;

use std::sync::Arc;

use serde::Serialize;

use crate::advertise::Advertiser;
use crate::classad::AdValue;
use crate::collector::{AdvertiseCmd, BusClient};
use crate::common::error::FactoryError;
use crate::common::timeutils::now_epoch;
use crate::config::{FrontendDescript, GlideinDescript, JobDescript, SignatureFile};
use crate::creds::crypto::FactoryKey;
use crate::creds::{self, escape_param, SubmitCredentials};
use crate::queue::status::StatusCounts;
use crate::queue::CondorQ;
use crate::schedd::ScheddClient;
use crate::submit::env::ClientWeb;
use crate::submit::selection::{create_selection_algorithm, EntrySelectionAlgorithm};
use crate::submit::GlideinSubmitter;
use crate::{Map, Result};
use downtime::DowntimeCalendar;
use reconcile::{keep_idle_glideins, ReconcileCtx};
use sanitize::HeldPolicy;
use totals::{FrontendKey, GlideinTotals};
use work::WorkRequest;

/// Security credential parameter names that reference on-disk files.
const FILE_CREDENTIAL_PARAMS: &[&str] = &[
    "SubmitProxy",
    "GlideinProxy",
    "PublicCert",
    "PrivateCert",
    "PublicKey",
    "PrivateKey",
    "AuthFile",
    "Username",
    "Password",
];

/// Identity credential parameter names passed by value.
const IDENTITY_CREDENTIAL_PARAMS: &[&str] = &["VMId", "VMType", "ProjectId", "frontend_scitoken"];

/// One entry under this factory's control.
pub struct Entry {
    pub glidein: Arc<GlideinDescript>,
    pub frontends: Arc<FrontendDescript>,
    pub signatures: Arc<SignatureFile>,
    pub job: JobDescript,
    pub downtimes: DowntimeCalendar,
    pub held_policy: HeldPolicy,
    pub selection: Box<dyn EntrySelectionAlgorithm>,
}

impl Entry {
    pub fn new(
        glidein: Arc<GlideinDescript>,
        frontends: Arc<FrontendDescript>,
        signatures: Arc<SignatureFile>,
        job: JobDescript,
        downtimes: DowntimeCalendar,
    ) -> Result<Entry> {
        let selection = create_selection_algorithm(&job.selection_algorithm)?;
        let held_policy = HeldPolicy::parse(&job.recoverable_hold_codes, &glidein.tuning);
        Ok(Entry {
            glidein,
            frontends,
            signatures,
            job,
            downtimes,
            held_policy,
            selection,
        })
    }

    pub fn name(&self) -> &str {
        &self.job.entry_name
    }
}

/// Outcome counters of one entry cycle, published via the monitoring ads.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub clients_seen: usize,
    pub clients_skipped: usize,
    pub glideins_submitted: i64,
    pub sanitized: i64,
}

/// The primary credential id tracked in the queue, per authentication
/// method.
fn request_credential_id(auth_method: &str, work: &WorkRequest) -> Option<String> {
    let primary = if auth_method.contains("grid_proxy") {
        "SubmitProxy"
    } else if auth_method.contains("cert_pair") {
        "PublicCert"
    } else if auth_method.contains("key_pair") {
        "PublicKey"
    } else if auth_method.contains("auth_file") {
        "AuthFile"
    } else if auth_method.contains("username_password") {
        "Username"
    } else if auth_method.contains("scitoken") {
        // the token travels by value; the queue tracks it under one id
        return Some("scitoken".to_string());
    } else {
        "GlideinProxy"
    };
    work.decrypted(primary).map(|s| s.to_string())
}

/// Pair a request with its on-disk credentials, enforcing the identity
/// binding and the auth-method parameter contract.
fn build_submit_credentials(
    entry: &Entry,
    work: &WorkRequest,
) -> Result<(SubmitCredentials, FrontendKey)> {
    let client_int_name = &work.client_int_name;

    let sec_name = work.decrypted("SecurityName").ok_or_else(|| {
        FactoryError::CredentialError(format!(
            "Client {client_int_name} did not provide a security name"
        ))
    })?;
    let sec_class = work.decrypted("SecurityClass").ok_or_else(|| {
        FactoryError::CredentialError(format!(
            "Client {client_int_name} did not provide a security class"
        ))
    })?;

    // The frontend security name binds to one bus identity; a request
    // arriving under any other identity is an impostor.
    let expected_identity = entry.frontends.get_identity(sec_name).ok_or_else(|| {
        FactoryError::CredentialError(format!(
            "Client {client_int_name} is not authorized by the factory. Supplied security name: \
             {sec_name}"
        ))
    })?;
    if work.authenticated_identity.as_deref() != Some(expected_identity) {
        return Err(FactoryError::CredentialError(format!(
            "Client {client_int_name} authenticated as {:?} but security name {sec_name} expects \
             {expected_identity}",
            work.authenticated_identity
        )));
    }

    creds::check_security_credentials(
        &entry.job.auth_method,
        &work.params_decrypted,
        client_int_name,
        &entry.job.entry_name,
    )?;

    let username = entry.frontends.get_username(sec_name, sec_class).ok_or_else(|| {
        FactoryError::CredentialError(format!(
            "No username mapped for {sec_name}:{sec_class}, skipping request from \
             {client_int_name}"
        ))
    })?;

    let mut credentials = SubmitCredentials::new(username, sec_class);
    credentials.cred_dir = entry.glidein.client_proxies_dir(username);
    credentials.id = request_credential_id(&entry.job.auth_method, work).ok_or_else(|| {
        FactoryError::CredentialError(format!(
            "Request from {client_int_name} carries no usable credential id"
        ))
    })?;

    for param in FILE_CREDENTIAL_PARAMS {
        if let Some(cred_id) = work.decrypted(param) {
            let filename = format!("{client_int_name}_{}", escape_param(cred_id));
            if !credentials.add_security_credential(param, &filename) {
                return Err(FactoryError::CredentialError(format!(
                    "Credential {param} of client {client_int_name} not found on disk \
                     ({filename}), skipping request"
                )));
            }
        }
    }
    for param in IDENTITY_CREDENTIAL_PARAMS {
        if let Some(value) = work.decrypted(param) {
            credentials.add_identity_credential(param, value);
        }
    }

    Ok((credentials, FrontendKey::new(sec_name, sec_class)))
}

fn client_web_from(work: &WorkRequest, glidein: &GlideinDescript) -> Option<ClientWeb> {
    let get = |name: &str| work.web.get(name).and_then(|v| v.as_str());
    let url = get("URL")?;
    let signtype = get("SignType")?;
    match ClientWeb::new(
        glidein,
        url,
        signtype,
        get("DescriptFile").unwrap_or_default(),
        get("DescriptSign").unwrap_or_default(),
        &work.group_name,
        get("GroupURL").unwrap_or_default(),
        get("GroupDescriptFile").unwrap_or_default(),
        get("GroupDescriptSign").unwrap_or_default(),
    ) {
        Ok(web) => Some(web),
        Err(e) => {
            log::warn!("Ignoring web staging block of {}: {e}", work.name);
            None
        }
    }
}

/// Folded status per submit file, for the selection algorithm.
fn status_by_submit_file(condorq: &CondorQ) -> Map<String, StatusCounts> {
    condorq
        .nested_group(|rec| rec.submit_file.clone().unwrap_or_default())
        .into_iter()
        .map(|(file, records)| {
            let q = CondorQ::from_records(&condorq.schedd_name, records);
            (file, q.status_counts())
        })
        .collect()
}

fn monitor_counts(counts: &StatusCounts) -> Map<String, AdValue> {
    let summed = counts.with_summed_idle();
    let mut out = Map::new();
    out.insert("StatusIdle".to_string(), AdValue::Int(summed.idle()));
    out.insert("StatusRunning".to_string(), AdValue::Int(summed.running()));
    out.insert("StatusHeld".to_string(), AdValue::Int(summed.held()));
    out.insert(
        "StatusStageOut".to_string(),
        AdValue::Int(summed.get(crate::queue::status::CODE_STAGEOUT)),
    );
    out
}

fn config_limits(job: &JobDescript) -> Map<String, AdValue> {
    let mut out = Map::new();
    out.insert(
        "PerEntryMaxGlideins".to_string(),
        AdValue::Int(job.per_entry_max_glideins),
    );
    out.insert(
        "PerEntryMaxIdle".to_string(),
        AdValue::Int(job.per_entry_max_idle),
    );
    out.insert(
        "PerEntryMaxHeld".to_string(),
        AdValue::Int(job.per_entry_max_held),
    );
    out
}

/// One full cycle for one entry: queue snapshot, per-request reconcile,
/// sanitize, advertise.
pub async fn run_cycle(
    entry: &Entry,
    bus: &dyn BusClient,
    schedd: &dyn ScheddClient,
    advertiser: &Advertiser,
    key: Option<&FactoryKey>,
    entry_work: &Map<String, WorkRequest>,
) -> Result<CycleStats> {
    let glidein: &GlideinDescript = &entry.glidein;
    let job = &entry.job;
    let mut stats = CycleStats::default();

    // One snapshot per cycle; every decision below sees the same queue.
    let condorq = CondorQ::load(
        schedd,
        &job.schedd,
        &glidein.factory_name,
        &glidein.glidein_name,
        &job.entry_name,
        None,
    )
    .await?;

    let mut glidein_totals = GlideinTotals::new(
        job,
        &entry.frontends.all_frontend_sec_classes(),
        &condorq,
        glidein.num_factories,
    )?;

    let in_downtime = entry.downtimes.is_in_downtime(&job.entry_name, now_epoch());
    if in_downtime {
        log::info!("Entry {} is in downtime; not growing the population", job.entry_name);
    }

    let file_status = status_by_submit_file(&condorq);
    let ctx = ReconcileCtx {
        schedd,
        tuning: &glidein.tuning,
        stale_ages: &glidein.stale_ages,
        held_policy: &entry.held_policy,
    };

    let mut client_ads = Vec::new();
    let mut names: Vec<&String> = entry_work.keys().collect();
    names.sort();
    for name in names {
        let work = &entry_work[name];
        stats.clients_seen += 1;

        let (credentials, frontend_key) = match build_submit_credentials(entry, work) {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("{e}");
                stats.clients_skipped += 1;
                continue;
            }
        };

        let req_min_idle = work.min_idle();
        let effective_min_idle = if in_downtime { 0 } else { req_min_idle };
        let req_max_glideins = work.max_glideins();
        let remove_excess = work.remove_excess();
        log::info!(
            "Client {} (secid: {frontend_key}) requesting {req_min_idle} glideins, max running \
             {req_max_glideins}, remove excess '{:?}'",
            work.client_int_name,
            remove_excess.mode
        );

        let frontend_tag = frontend_key.to_string();
        let client_condorq = condorq.sub_query(|rec| {
            rec.client_name.as_deref() == Some(work.client_int_name.as_str())
                && rec.security_class.as_deref() == Some(credentials.security_class.as_str())
        });

        let client_web = client_web_from(work, glidein);
        let submitter = GlideinSubmitter {
            glidein,
            job,
            signatures: &entry.signatures,
            tuning: &glidein.tuning,
            schedd,
            selection: entry.selection.as_ref(),
            client_name: &work.client_int_name,
            frontend_name: &frontend_tag,
            submit_credentials: &credentials,
            client_web: client_web.as_ref(),
            params: &work.params,
            idle_lifetime: work.idle_lifetime(),
            file_status: &file_status,
        };

        let submitted = keep_idle_glideins(
            &client_condorq,
            &work.client_int_name,
            effective_min_idle,
            req_max_glideins,
            remove_excess,
            &credentials,
            &mut glidein_totals,
            &frontend_key,
            &submitter,
            &ctx,
        )
        .await
        .unwrap_or_else(|e| {
            log::warn!("Request {} failed: {e}", work.name);
            0
        });
        stats.glideins_submitted += submitted;

        // Per-client monitoring ad reflecting the just-taken actions.
        let mut monitors = monitor_counts(&client_condorq.status_counts());
        monitors.insert("RequestedIdle".to_string(), AdValue::Int(req_min_idle));
        monitors.insert(
            "RequestedMaxGlideins".to_string(),
            AdValue::Int(req_max_glideins),
        );
        monitors.insert("GlideinsSubmitted".to_string(), AdValue::Int(submitted));
        let client_params: Map<String, AdValue> = work
            .params
            .iter()
            .map(|(k, v)| (k.clone(), AdValue::Str(v.clone())))
            .collect();
        client_ads.push(advertiser.client_classad(
            glidein,
            &job.entry_name,
            &work.name,
            &work.client_int_name,
            &work.req_name,
            &Map::new(),
            &client_params,
            &monitors,
        ));
    }

    // Maintenance runs whether or not anybody asked for pilots.
    stats.sanitized = sanitize::sanitize_glideins(
        &condorq,
        schedd,
        &glidein.tuning,
        &glidein.stale_ages,
        &entry.held_policy,
    )
    .await?;

    // Advertise after all submissions so the counters include them.
    let entry_monitors = monitor_counts(&condorq.status_counts());
    let entry_ad = advertiser.entry_classad(
        glidein,
        job,
        key,
        &Map::new(),
        &Map::new(),
        &Map::new(),
        &entry_monitors,
        &Map::new(),
        &config_limits(job),
    );
    if let Err(e) = advertiser
        .advertise_ads(bus, &[entry_ad], AdvertiseCmd::UpdateAdGeneric)
        .await
    {
        log::warn!("Advertising glidefactory classad failed: {e}");
    }
    if let Err(e) = advertiser
        .advertise_ads(bus, &client_ads, AdvertiseCmd::UpdateLicenseAd)
        .await
    {
        log::warn!("Advertising glidefactoryclient classads failed: {e}");
    }

    Ok(stats)
}

/// Process every `glideclientglobal` ad on the bus, materializing the
/// credentials they carry. One bad classad never poisons the others.
pub async fn process_global_credentials(
    bus: &dyn BusClient,
    glidein: &GlideinDescript,
    frontends: &FrontendDescript,
    key: &FactoryKey,
) -> usize {
    let ads = match work::find_global_work(bus).await {
        Ok(ads) => ads,
        Err(e) => {
            log::warn!("Could not fetch glideclientglobal classads: {e}");
            return 0;
        }
    };
    let mut updated = 0;
    for ad in &ads {
        let name = ad.get_str("Name").unwrap_or("<unnamed>");
        match creds::process_global(ad, glidein, frontends, key) {
            Ok(n) => updated += n,
            Err(e) => {
                log::warn!("Error occurred processing the globals classad {name}: {e}");
            }
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classad::ClassAd;
    use crate::common::fsutils;
    use crate::creds::crypto::SymKey;
    use crate::schedd::mock::MockSchedd;
    use crate::Result;
    use std::cell::RefCell;
    use std::future::Future;
    use std::path::Path;
    use std::pin::Pin;

    struct MockBus {
        calls: RefCell<Vec<(String, AdvertiseCmd, bool)>>,
    }

    impl MockBus {
        fn new() -> Self {
            MockBus {
                calls: RefCell::new(vec![]),
            }
        }
    }

    impl BusClient for MockBus {
        fn advertise<'a>(
            &'a self,
            fname: &'a Path,
            cmd: AdvertiseCmd,
            is_multi: bool,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
            Box::pin(async move {
                let body = std::fs::read_to_string(fname).unwrap();
                self.calls.borrow_mut().push((body, cmd, is_multi));
                Ok(())
            })
        }

        fn query_ads<'a>(
            &'a self,
            _constraint: &'a str,
            _require_integrity: Option<bool>,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>> {
            Box::pin(async move { Ok(vec![]) })
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        entry: Entry,
        key: FactoryKey,
        session: SymKey,
        advertiser: Advertiser,
    }

    impl Harness {
        fn new() -> Harness {
            let dir = tempfile::TempDir::new().unwrap();
            let mut glidein = crate::submit::env::tests::test_glidein(dir.path());
            glidein.tuning.submit_sleep = 0.0;
            glidein.tuning.remove_sleep = 0.0;
            glidein.tuning.release_sleep = 0.0;
            let glidein = Arc::new(glidein);

            let mut frontends = FrontendDescript::default();
            frontends.add_identity("vofrontend", "fe@collector");
            frontends.add_username("vofrontend", "frontend", "fecms");
            let frontends = Arc::new(frontends);

            let signatures = Arc::new(crate::submit::env::tests::test_signatures());
            let job = crate::entry::totals::tests::test_job_descript();

            let entry_dir = dir.path().join("entry_osg_test");
            std::fs::create_dir_all(&entry_dir).unwrap();
            std::fs::write(entry_dir.join("job.condor"), "universe = grid\n").unwrap();

            let entry = Entry::new(
                glidein.clone(),
                frontends,
                signatures,
                job,
                DowntimeCalendar::default(),
            )
            .unwrap();

            let advertiser = Advertiser::new(dir.path().to_path_buf(), false);
            Harness {
                dir,
                entry,
                key: FactoryKey::generate().unwrap(),
                session: SymKey::new_random().unwrap(),
                advertiser,
            }
        }

        /// Put the credential file where the request expects it.
        fn materialize_credential(&self, cred_id: &str) {
            let cred_dir = self.entry.glidein.client_proxies_dir("fecms");
            fsutils::ensure_dir(&cred_dir).unwrap();
            std::fs::write(
                cred_dir.join(format!("credential_client1_{}", escape_param(cred_id))),
                b"PROXY",
            )
            .unwrap();
        }

        fn work(&self, min_idle: i64, max_glideins: i64) -> Map<String, WorkRequest> {
            let mut work = WorkRequest {
                name: "client1".to_string(),
                client_int_name: "client1".to_string(),
                req_name: "osg_test@v1_0@factory".to_string(),
                frontend_name: "fe_daemon".to_string(),
                group_name: "main".to_string(),
                authenticated_identity: Some("fe@collector".to_string()),
                ..Default::default()
            };
            work.requests
                .insert("IdleGlideins".to_string(), AdValue::Int(min_idle));
            work.requests
                .insert("MaxGlideins".to_string(), AdValue::Int(max_glideins));
            work.requests
                .insert("RemoveExcess".to_string(), AdValue::Str("WAIT".to_string()));
            work.params_decrypted
                .insert("SecurityName".to_string(), "vofrontend".to_string());
            work.params_decrypted
                .insert("SecurityClass".to_string(), "frontend".to_string());
            work.params_decrypted
                .insert("SubmitProxy".to_string(), "cred1".to_string());
            let mut out = Map::new();
            out.insert(work.name.clone(), work);
            out
        }
    }

    #[tokio::test]
    async fn fresh_entry_cycle_submits_and_advertises() {
        let hx = Harness::new();
        hx.materialize_credential("cred1");
        let bus = MockBus::new();
        let schedd = MockSchedd::with_submit_outputs(vec![
            "5 job(s) submitted to cluster 42.\n".to_string(),
        ]);

        let stats = run_cycle(
            &hx.entry,
            &bus,
            &schedd,
            &hx.advertiser,
            Some(&hx.key),
            &hx.work(5, 10),
        )
        .await
        .unwrap();

        assert_eq!(stats.glideins_submitted, 5);
        assert_eq!(stats.clients_skipped, 0);

        let envs = schedd.submit_envs.borrow();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0]["GLIDEIN_COUNT"], "5");
        assert_eq!(envs[0]["GLIDEIN_FRONTEND_NAME"], "vofrontend:frontend");
        drop(envs);

        // one glidefactory ad and one glidefactoryclient ad, both seq 0
        let calls = bus.calls.borrow();
        assert_eq!(calls.len(), 2);
        let (factory_body, factory_cmd, _) = &calls[0];
        assert_eq!(*factory_cmd, AdvertiseCmd::UpdateAdGeneric);
        assert!(factory_body.contains("MyType = \"glidefactory\""));
        assert!(factory_body.contains("UpdateSequenceNumber = 0"));
        assert!(factory_body.contains("GlideinConfigPerEntryMaxGlideins = 100"));
        let (client_body, client_cmd, _) = &calls[1];
        assert_eq!(*client_cmd, AdvertiseCmd::UpdateLicenseAd);
        assert!(client_body.contains("MyType = \"glidefactoryclient\""));
        assert!(client_body.contains("UpdateSequenceNumber = 0"));
        assert!(client_body.contains("GlideinMonitorRequestedIdle = 5"));
        assert!(client_body.contains("ReqGlidein = \"osg_test@v1_0@factory\""));
    }

    #[tokio::test]
    async fn missing_credential_skips_request_but_still_advertises() {
        let hx = Harness::new();
        // no credential on disk
        let bus = MockBus::new();
        let schedd = MockSchedd::default();

        let stats = run_cycle(
            &hx.entry,
            &bus,
            &schedd,
            &hx.advertiser,
            Some(&hx.key),
            &hx.work(5, 10),
        )
        .await
        .unwrap();

        assert_eq!(stats.glideins_submitted, 0);
        assert_eq!(stats.clients_skipped, 1);
        assert!(schedd.actions.borrow().is_empty());
        // entry ad still goes out
        assert!(bus
            .calls
            .borrow()
            .iter()
            .any(|(body, _, _)| body.contains("MyType = \"glidefactory\"")));
    }

    #[tokio::test]
    async fn wrong_identity_is_rejected() {
        let hx = Harness::new();
        hx.materialize_credential("cred1");
        let bus = MockBus::new();
        let schedd = MockSchedd::default();

        let mut entry_work = hx.work(5, 10);
        entry_work.get_mut("client1").unwrap().authenticated_identity =
            Some("mallory@collector".to_string());

        let stats = run_cycle(
            &hx.entry,
            &bus,
            &schedd,
            &hx.advertiser,
            Some(&hx.key),
            &entry_work,
        )
        .await
        .unwrap();

        assert_eq!(stats.clients_skipped, 1);
        assert!(schedd.actions.borrow().is_empty());
    }

    #[tokio::test]
    async fn downtime_zeroes_the_effective_request() {
        let mut hx = Harness::new();
        hx.materialize_credential("cred1");
        let downtime_file = hx.dir.path().join("downtimes");
        std::fs::write(&downtime_file, "0 None osg_test\n").unwrap();
        hx.entry.downtimes = DowntimeCalendar::load(&downtime_file).unwrap();

        let bus = MockBus::new();
        let schedd = MockSchedd::default();
        let stats = run_cycle(
            &hx.entry,
            &bus,
            &schedd,
            &hx.advertiser,
            Some(&hx.key),
            &hx.work(5, 10),
        )
        .await
        .unwrap();

        // nothing submitted and nothing to clean on an empty queue
        assert_eq!(stats.glideins_submitted, 0);
        assert!(schedd.actions.borrow().is_empty());
    }

    #[tokio::test]
    async fn global_credentials_flow_to_disk() {
        let hx = Harness::new();

        struct GlobalBus {
            ad: ClassAd,
        }
        impl BusClient for GlobalBus {
            fn advertise<'a>(
                &'a self,
                _fname: &'a Path,
                _cmd: AdvertiseCmd,
                _is_multi: bool,
            ) -> Pin<Box<dyn Future<Output = Result<()>> + 'a>> {
                Box::pin(async move { Ok(()) })
            }
            fn query_ads<'a>(
                &'a self,
                constraint: &'a str,
                _require_integrity: Option<bool>,
            ) -> Pin<Box<dyn Future<Output = Result<Vec<ClassAd>>> + 'a>> {
                Box::pin(async move {
                    assert!(constraint.contains("glideclientglobal"));
                    Ok(vec![self.ad.clone()])
                })
            }
        }

        let enc = |v: &[u8]| hx.session.encrypt_hex(v).unwrap();
        let mut ad = ClassAd::new();
        ad.set_str("Name", "client1");
        ad.set_str("ClientName", "client1");
        ad.set_str("AuthenticatedIdentity", "fe@collector");
        ad.set_str("ReqEncKeyCode", hx.key.seal_sym_key(&hx.session).unwrap());
        ad.set_str("ReqEncIdentity", enc(b"fe@collector"));
        ad.set_str("GlideinEncParamSecurityName", enc(b"vofrontend"));
        ad.set_str("GlideinEncParamSecurityClassmain_proxy", enc(b"frontend"));
        ad.set_str("GlideinEncParammain_proxy", enc(b"PROXY BYTES"));

        let bus = GlobalBus { ad };
        let updated =
            process_global_credentials(&bus, &hx.entry.glidein, &hx.entry.frontends, &hx.key)
                .await;
        assert_eq!(updated, 1);
        let cred = hx
            .entry
            .glidein
            .client_proxies_dir("fecms")
            .join("credential_client1_main_proxy");
        assert_eq!(std::fs::read(cred).unwrap(), b"PROXY BYTES");
    }
}
