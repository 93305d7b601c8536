//! Building and publishing the factory's classads.

use std::io::Write;
use std::path::PathBuf;

use crate::classad::{self, AdValue, ClassAd};
use crate::collector::{AdvertiseCmd, BusClient};
use crate::common::error::FactoryError;
use crate::common::timeutils::now_epoch;
use crate::config::{GlideinDescript, JobDescript};
use crate::creds::crypto::FactoryKey;
use crate::{Map, Result, FACTORY_VERSION};

pub const FACTORY_ID: &str = "glidefactory";
pub const FACTORY_GLOBAL_ID: &str = "glidefactoryglobal";
pub const FACTORYCLIENT_ID: &str = "glidefactoryclient";
pub const CLIENT_ID: &str = "glideclient";
pub const CLIENT_GLOBAL_ID: &str = "glideclientglobal";

// Attribute namespace prefixes; they partition the classad deterministically.
pub const SUBMIT_PREFIX: &str = "GlideinSubmit";
pub const PARAM_PREFIX: &str = "GlideinParam";
pub const MONITOR_PREFIX: &str = "GlideinMonitor";
pub const CONFIG_PREFIX: &str = "GlideinConfig";
pub const ENC_PARAM_PREFIX: &str = "GlideinEncParam";
pub const REQ_PREFIX: &str = "Req";
pub const WEB_PREFIX: &str = "Web";

/// Owns the per-`Name` advertise sequence counters and the scratch space
/// for classad files.
pub struct Advertiser {
    start_time: i64,
    scratch_dir: PathBuf,
    use_multi: bool,
    counters: std::sync::Mutex<Map<String, i64>>,
}

/// Copy a namespace dictionary into the ad under its prefix.
///
/// Attribute names starting with `+` become `_PLUS_<rest>`; integers are
/// emitted bare, everything else as an escaped string.
fn write_prefixed(ad: &mut ClassAd, prefix: &str, data: &Map<String, AdValue>) {
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let value = &data[name];
        let attr = match name.strip_prefix('+') {
            Some(rest) => format!("_PLUS_{rest}"),
            None => name.clone(),
        };
        ad.set(&format!("{prefix}{attr}"), value.clone());
    }
}

impl Advertiser {
    pub fn new(scratch_dir: PathBuf, use_multi: bool) -> Advertiser {
        Advertiser {
            start_time: now_epoch(),
            scratch_dir,
            use_multi,
            counters: std::sync::Mutex::new(Map::new()),
        }
    }

    /// Next `UpdateSequenceNumber` for a classad name; starts at 0 and is
    /// monotonic for the process lifetime, advertise failures included.
    fn next_seq(&self, name: &str) -> i64 {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(name.to_string()).or_insert(-1);
        *counter += 1;
        *counter
    }

    fn stamp_common(&self, ad: &mut ClassAd, my_type: &str, name: &str) {
        ad.set_str("MyType", my_type);
        ad.set_str("GlideinMyType", my_type);
        ad.set_str("GlideinWMSVersion", FACTORY_VERSION);
        ad.set_str("Name", name);
        ad.set_int("UpdateSequenceNumber", self.next_seq(name));
    }

    fn stamp_pub_key(ad: &mut ClassAd, key: &FactoryKey) {
        ad.set_str("PubKeyID", key.key_id());
        ad.set_str("PubKeyType", key.key_type());
        // real newlines; the codec emits them as literal \n
        ad.set_str("PubKeyValue", key.pub_key_pem());
    }

    /// The per-entry `glidefactory` ad.
    #[allow(clippy::too_many_arguments)]
    pub fn entry_classad(
        &self,
        glidein: &GlideinDescript,
        job: &JobDescript,
        key: Option<&FactoryKey>,
        glidein_submit: &Map<String, AdValue>,
        glidein_attrs: &Map<String, AdValue>,
        glidein_params: &Map<String, AdValue>,
        glidein_monitors: &Map<String, AdValue>,
        glidein_web_attrs: &Map<String, AdValue>,
        glidein_config_limits: &Map<String, AdValue>,
    ) -> ClassAd {
        let classad_name = format!(
            "{}@{}@{}",
            job.entry_name, glidein.glidein_name, glidein.factory_name
        );
        let mut ad = ClassAd::new();
        self.stamp_common(&mut ad, FACTORY_ID, &classad_name);
        ad.set_str("FactoryName", &glidein.factory_name);
        ad.set_str("GlideinName", &glidein.glidein_name);
        ad.set_str("EntryName", &job.entry_name);
        ad.set_str("TrustDomain", &job.trust_domain);
        ad.set_str("AuthMethod", &job.auth_method);
        ad.set_str("SupportedSignTypes", glidein.supported_signtypes.join(","));
        ad.set_int("DaemonStartTime", self.start_time);

        if let Some(key) = key {
            Self::stamp_pub_key(&mut ad, key);
        }
        let uses_grid_proxy = job.auth_method.contains("grid_proxy");
        ad.set_str("GlideinAllowx509_Proxy", bool_str(uses_grid_proxy));
        ad.set_str("GlideinRequirex509_Proxy", bool_str(uses_grid_proxy));
        ad.set_str("GlideinRequireGlideinProxy", bool_str(!uses_grid_proxy));

        for (prefix, data) in [
            (SUBMIT_PREFIX, glidein_submit),
            ("", glidein_attrs),
            (PARAM_PREFIX, glidein_params),
            (MONITOR_PREFIX, glidein_monitors),
            (WEB_PREFIX, glidein_web_attrs),
            (CONFIG_PREFIX, glidein_config_limits),
        ] {
            write_prefixed(&mut ad, prefix, data);
        }
        ad
    }

    /// The factory-wide `glidefactoryglobal` ad carrying the public key.
    pub fn global_classad(&self, glidein: &GlideinDescript, key: &FactoryKey) -> ClassAd {
        let classad_name = format!("{}@{}", glidein.glidein_name, glidein.factory_name);
        let mut ad = ClassAd::new();
        self.stamp_common(&mut ad, FACTORY_GLOBAL_ID, &classad_name);
        ad.set_str("FactoryName", &glidein.factory_name);
        ad.set_str("GlideinName", &glidein.glidein_name);
        ad.set_str("SupportedSignTypes", glidein.supported_signtypes.join(","));
        ad.set_int("DaemonStartTime", self.start_time);
        Self::stamp_pub_key(&mut ad, key);
        ad
    }

    /// One `glidefactoryclient` monitoring ad per (entry, frontend) that
    /// made a request this cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn client_classad(
        &self,
        glidein: &GlideinDescript,
        entry_name: &str,
        client_name: &str,
        client_int_name: &str,
        client_int_req: &str,
        glidein_attrs: &Map<String, AdValue>,
        client_params: &Map<String, AdValue>,
        client_monitors: &Map<String, AdValue>,
    ) -> ClassAd {
        let mut ad = ClassAd::new();
        self.stamp_common(&mut ad, FACTORYCLIENT_ID, client_name);
        ad.set_str(
            "ReqGlidein",
            format!(
                "{entry_name}@{}@{}",
                glidein.glidein_name, glidein.factory_name
            ),
        );
        ad.set_str("ReqFactoryName", &glidein.factory_name);
        ad.set_str("ReqGlideinName", &glidein.glidein_name);
        ad.set_str("ReqEntryName", entry_name);
        ad.set_str("ReqClientName", client_int_name);
        ad.set_str("ReqClientReqName", client_int_req);

        for (prefix, data) in [
            ("", glidein_attrs),
            (PARAM_PREFIX, client_params),
            (MONITOR_PREFIX, client_monitors),
        ] {
            write_prefixed(&mut ad, prefix, data);
        }
        ad
    }

    /// Publish a batch of ads under one verb. With multi-ad support the
    /// whole batch goes out as a single blank-line-separated file,
    /// otherwise one advertise per ad. A failing ad does not stop the
    /// others; the first failure is reported at the end.
    pub async fn advertise_ads(
        &self,
        bus: &dyn BusClient,
        ads: &[ClassAd],
        cmd: AdvertiseCmd,
    ) -> Result<()> {
        if ads.is_empty() {
            return Ok(());
        }
        if self.use_multi {
            let body = classad::serialize_multi(ads);
            self.advertise_body(bus, &body, cmd, true).await
        } else {
            let mut first_error = None;
            for ad in ads {
                let result = self.advertise_body(bus, &ad.serialize(), cmd, false).await;
                if let Err(e) = result {
                    log::warn!("Advertising classad failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    async fn advertise_body(
        &self,
        bus: &dyn BusClient,
        body: &str,
        cmd: AdvertiseCmd,
        is_multi: bool,
    ) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("gfi_ad_")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| FactoryError::BusError(format!("cannot create classad file: {e}")))?;
        file.write_all(body.as_bytes())
            .map_err(|e| FactoryError::BusError(format!("cannot write classad file: {e}")))?;
        bus.advertise(file.path(), cmd, is_multi).await
    }

    /// Invalidate the `glidefactory` ad of one entry.
    pub async fn deadvertise_entry(
        &self,
        bus: &dyn BusClient,
        glidein: &GlideinDescript,
        entry_name: &str,
    ) -> Result<()> {
        let ad = invalidate_ad(
            FACTORY_ID,
            &format!(
                "(Name == \"{entry_name}@{}@{}\")&&(GlideinMyType == \"{FACTORY_ID}\")",
                glidein.glidein_name, glidein.factory_name
            ),
        );
        self.advertise_body(bus, &ad.serialize(), AdvertiseCmd::InvalidateAdsGeneric, false)
            .await
    }

    /// Invalidate the `glidefactoryglobal` ad.
    pub async fn deadvertise_global(
        &self,
        bus: &dyn BusClient,
        glidein: &GlideinDescript,
    ) -> Result<()> {
        let ad = invalidate_ad(
            FACTORY_GLOBAL_ID,
            &format!(
                "(Name == \"{}@{}\")&&(GlideinMyType == \"{FACTORY_GLOBAL_ID}\")",
                glidein.glidein_name, glidein.factory_name
            ),
        );
        self.advertise_body(bus, &ad.serialize(), AdvertiseCmd::InvalidateAdsGeneric, false)
            .await
    }

    /// Invalidate every monitoring ad of one entry.
    pub async fn deadvertise_client_monitoring(
        &self,
        bus: &dyn BusClient,
        glidein: &GlideinDescript,
        entry_name: &str,
    ) -> Result<()> {
        let ad = invalidate_ad(
            FACTORYCLIENT_ID,
            &format!(
                "(ReqGlidein == \"{entry_name}@{}@{}\")&&(GlideinMyType == \"{FACTORYCLIENT_ID}\")",
                glidein.glidein_name, glidein.factory_name
            ),
        );
        self.advertise_body(bus, &ad.serialize(), AdvertiseCmd::InvalidateLicenseAds, false)
            .await
    }
}

fn bool_str(v: bool) -> &'static str {
    if v { "True" } else { "False" }
}

fn invalidate_ad(target_type: &str, requirements: &str) -> ClassAd {
    let mut ad = ClassAd::new();
    ad.set_str("MyType", "Query");
    ad.set_str("TargetType", target_type);
    ad.set_expr("Requirements", requirements);
    ad
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::future::Future;
    use std::path::Path;
    use std::pin::Pin;

    struct MockBus {
        /// (file body, verb, multi) per advertise call
        calls: RefCell<Vec<(String, AdvertiseCmd, bool)>>,
        fail: bool,
    }

    impl MockBus {
        fn new() -> Self {
            MockBus {
                calls: RefCell::new(vec![]),
                fail: false,
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
                if self.fail {
                    Err(FactoryError::BusError("collector unreachable".to_string()))
                } else {
                    Ok(())
                }
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

    fn glidein(dir: &Path) -> GlideinDescript {
        crate::submit::env::tests::test_glidein(dir)
    }

    fn job() -> JobDescript {
        crate::entry::totals::tests::test_job_descript()
    }

    fn empty() -> Map<String, AdValue> {
        Map::new()
    }

    #[test]
    fn entry_ad_has_the_mandatory_attributes() {
        let dir = tempfile::TempDir::new().unwrap();
        let advertiser = Advertiser::new(dir.path().to_path_buf(), false);
        let key = FactoryKey::generate().unwrap();

        let mut params = Map::new();
        params.insert("GLIDEIN_Count".to_string(), AdValue::Int(5));
        let mut attrs = Map::new();
        attrs.insert("+SpecialAttr".to_string(), AdValue::Str("x".to_string()));

        let ad = advertiser.entry_classad(
            &glidein(dir.path()),
            &job(),
            Some(&key),
            &empty(),
            &attrs,
            &params,
            &empty(),
            &empty(),
            &empty(),
        );

        assert_eq!(ad.get_str("MyType"), Some("glidefactory"));
        assert_eq!(ad.get_str("GlideinMyType"), Some("glidefactory"));
        assert!(ad.get_str("GlideinWMSVersion").is_some());
        assert_eq!(ad.get_str("Name"), Some("osg_test@v1_0@factory"));
        assert_eq!(ad.get_int("UpdateSequenceNumber"), Some(0));
        // grid_proxy entry wants a proxy, not a glidein proxy
        assert_eq!(ad.get_str("GlideinAllowx509_Proxy"), Some("True"));
        assert_eq!(ad.get_str("GlideinRequireGlideinProxy"), Some("False"));
        assert_eq!(ad.get_str("PubKeyID"), Some(key.key_id()));
        // + attribute mangling and bare integers
        assert!(ad.contains("_PLUS_SpecialAttr"));
        assert_eq!(ad.get_int("GlideinParamGLIDEIN_Count"), Some(5));
        // PEM newlines survive the codec as literal \n
        let body = ad.serialize();
        assert!(body.contains("\\n"));
    }

    #[test]
    fn sequence_numbers_are_monotonic_per_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let advertiser = Advertiser::new(dir.path().to_path_buf(), false);
        let glidein = glidein(dir.path());
        let job = job();

        for expected in 0..3 {
            let ad = advertiser.entry_classad(
                &glidein,
                &job,
                None,
                &empty(),
                &empty(),
                &empty(),
                &empty(),
                &empty(),
                &empty(),
            );
            assert_eq!(ad.get_int("UpdateSequenceNumber"), Some(expected));
        }
        // a different name has its own counter
        let key = FactoryKey::generate().unwrap();
        let global = advertiser.global_classad(&glidein, &key);
        assert_eq!(global.get_int("UpdateSequenceNumber"), Some(0));
    }

    #[tokio::test]
    async fn counters_survive_advertise_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let advertiser = Advertiser::new(dir.path().to_path_buf(), false);
        let glidein = glidein(dir.path());
        let job = job();
        let mut bus = MockBus::new();
        bus.fail = true;

        let ad = advertiser.entry_classad(
            &glidein,
            &job,
            None,
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            &empty(),
        );
        assert!(advertiser
            .advertise_ads(&bus, &[ad], AdvertiseCmd::UpdateAdGeneric)
            .await
            .is_err());

        let ad = advertiser.entry_classad(
            &glidein,
            &job,
            None,
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            &empty(),
            &empty(),
        );
        assert_eq!(ad.get_int("UpdateSequenceNumber"), Some(1));
    }

    #[tokio::test]
    async fn multi_batches_go_out_as_one_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let advertiser = Advertiser::new(dir.path().to_path_buf(), true);
        let glidein = glidein(dir.path());
        let bus = MockBus::new();

        let a = advertiser.client_classad(
            &glidein,
            "osg_test",
            "client_a",
            "client_a_int",
            "req_a",
            &empty(),
            &empty(),
            &empty(),
        );
        let b = advertiser.client_classad(
            &glidein,
            "osg_test",
            "client_b",
            "client_b_int",
            "req_b",
            &empty(),
            &empty(),
            &empty(),
        );
        advertiser
            .advertise_ads(&bus, &[a, b], AdvertiseCmd::UpdateLicenseAd)
            .await
            .unwrap();

        let calls = bus.calls.borrow();
        assert_eq!(calls.len(), 1);
        let (body, cmd, multi) = &calls[0];
        assert_eq!(*cmd, AdvertiseCmd::UpdateLicenseAd);
        assert!(*multi);
        assert!(!body.starts_with('\n'));
        assert_eq!(body.matches("MyType = \"glidefactoryclient\"").count(), 2);
        assert!(body.contains("ReqGlidein = \"osg_test@v1_0@factory\""));
    }

    #[tokio::test]
    async fn without_multi_each_ad_goes_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let advertiser = Advertiser::new(dir.path().to_path_buf(), false);
        let glidein = glidein(dir.path());
        let bus = MockBus::new();

        let a = advertiser.client_classad(
            &glidein, "osg_test", "ca", "ca", "r", &empty(), &empty(), &empty(),
        );
        let b = advertiser.client_classad(
            &glidein, "osg_test", "cb", "cb", "r", &empty(), &empty(), &empty(),
        );
        advertiser
            .advertise_ads(&bus, &[a, b], AdvertiseCmd::UpdateLicenseAd)
            .await
            .unwrap();
        assert_eq!(bus.calls.borrow().len(), 2);
    }

    #[tokio::test]
    async fn deadvertise_builds_query_ads() {
        let dir = tempfile::TempDir::new().unwrap();
        let advertiser = Advertiser::new(dir.path().to_path_buf(), false);
        let glidein = glidein(dir.path());
        let bus = MockBus::new();

        advertiser
            .deadvertise_entry(&bus, &glidein, "osg_test")
            .await
            .unwrap();
        advertiser
            .deadvertise_client_monitoring(&bus, &glidein, "osg_test")
            .await
            .unwrap();

        let calls = bus.calls.borrow();
        let (body, cmd, _) = &calls[0];
        assert_eq!(*cmd, AdvertiseCmd::InvalidateAdsGeneric);
        assert!(body.contains("MyType = \"Query\""));
        assert!(body.contains("TargetType = \"glidefactory\""));
        assert!(body.contains(
            "Requirements = (Name == \"osg_test@v1_0@factory\")&&(GlideinMyType == \"glidefactory\")"
        ));
        let (_, cmd, _) = &calls[1];
        assert_eq!(*cmd, AdvertiseCmd::InvalidateLicenseAds);
    }
}
