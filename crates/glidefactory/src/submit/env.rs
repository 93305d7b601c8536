//! Environment block handed to the gateway submit tool. The submit file
//! reads everything through these variables, so the whole pilot contract
//! lives here.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use itertools::Itertools;

use crate::common::error::FactoryError;
use crate::common::timeutils::today_lognr;
use crate::config::{GlideinDescript, GridType, JobDescript, SignatureFile};
use crate::creds::{escape_param, SubmitCredentials};
use crate::{Map, Result};

/// Web staging block supplied by the client request.
#[derive(Debug, Clone)]
pub struct ClientWeb {
    pub url: String,
    pub signtype: String,
    pub descript: String,
    pub sign: String,
    pub group_name: String,
    pub group_url: String,
    pub group_descript: String,
    pub group_sign: String,
}

impl ClientWeb {
    pub fn new(
        glidein: &GlideinDescript,
        url: &str,
        signtype: &str,
        descript: &str,
        sign: &str,
        group_name: &str,
        group_url: &str,
        group_descript: &str,
        group_sign: &str,
    ) -> Result<ClientWeb> {
        if !glidein.supported_signtypes.iter().any(|t| t == signtype) {
            return Err(FactoryError::GenericError(format!(
                "Signtype '{signtype}' not supported!"
            )));
        }
        Ok(ClientWeb {
            url: url.to_string(),
            signtype: signtype.to_string(),
            descript: descript.to_string(),
            sign: sign.to_string(),
            group_name: group_name.to_string(),
            group_url: group_url.to_string(),
            group_descript: group_descript.to_string(),
            group_sign: group_sign.to_string(),
        })
    }

    pub fn get_glidein_args(&self) -> Vec<String> {
        vec![
            "-clientweb".to_string(),
            self.url.clone(),
            "-clientsign".to_string(),
            self.sign.clone(),
            "-clientsigntype".to_string(),
            self.signtype.clone(),
            "-clientdescript".to_string(),
            self.descript.clone(),
            "-clientgroup".to_string(),
            self.group_name.clone(),
            "-clientwebgroup".to_string(),
            self.group_url.clone(),
            "-clientsigngroup".to_string(),
            self.group_sign.clone(),
            "-clientdescriptgroup".to_string(),
            self.group_descript.clone(),
        ]
    }
}

fn sec_cred<'a>(creds: &'a SubmitCredentials, kind: &str) -> Result<&'a str> {
    creds
        .security_credential(kind)
        .and_then(|p| p.to_str())
        .ok_or_else(|| {
            FactoryError::CredentialError(format!("credential '{kind}' is missing from the request"))
        })
}

fn id_cred<'a>(creds: &'a SubmitCredentials, kind: &str) -> Result<&'a str> {
    creds.identity_credential(kind).ok_or_else(|| {
        FactoryError::CredentialError(format!(
            "identity credential '{kind}' is missing from the request"
        ))
    })
}

fn userdata_ini(
    glidein_arguments: &str,
    web_url: &str,
    contextualization: &str,
    params: &Map<String, String>,
) -> String {
    let vm_max_lifetime = params
        .get("VM_MAX_LIFETIME")
        .cloned()
        // default to 12 hours when the frontend does not say
        .unwrap_or_else(|| "43200".to_string());
    let vm_disable_shutdown = params
        .get("VM_DISABLE_SHUTDOWN")
        .cloned()
        .unwrap_or_else(|| "False".to_string());
    format!(
        "[glidein_startup]\n\
         args = {glidein_arguments}\n\
         proxy_file_name = pilot_proxy\n\
         webbase= {web_url}\n\
         \n\
         [vm_properties]\n\
         max_lifetime = {vm_max_lifetime}\n\
         contextualization_type = {contextualization}\n\
         disable_shutdown = {vm_disable_shutdown}\n\
         admin_email = UNSUPPORTED\n\
         email_logs = False\n"
    )
}

/// Build the ordered `KEY=VALUE` environment for one submission.
#[allow(clippy::too_many_arguments)]
pub fn get_submit_environment(
    glidein: &GlideinDescript,
    job: &JobDescript,
    signatures: &SignatureFile,
    client_name: &str,
    submit_credentials: &SubmitCredentials,
    client_web: Option<&ClientWeb>,
    params: &Map<String, String>,
    idle_lifetime: i64,
) -> Result<Vec<(String, String)>> {
    let entry_name = &job.entry_name;

    // Parameter pack forwarded to the pilot startup arguments.
    let mut params_str = String::new();
    if let Some(web) = client_web {
        params_str = web.get_glidein_args().iter().join(" ");
    }
    let mut param_names: Vec<&String> = params.keys().collect();
    param_names.sort();
    for k in param_names {
        let v = &params[k];
        if v.trim().is_empty() {
            log::warn!("Skipping empty job parameter ({k})");
            continue;
        }
        params_str.push_str(&format!(" -param_{k} {}", escape_param(v)));
    }

    let mut exe_env: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: String| exe_env.push((k.to_string(), v));

    push("GLIDEIN_ENTRY_NAME", entry_name.clone());
    push("GLIDEIN_CLIENT", client_name.to_string());
    push("GLIDEIN_SEC_CLASS", submit_credentials.security_class.clone());
    push("GLIDEIN_USER", submit_credentials.username.clone());
    push("GLIDEIN_CREDENTIAL_ID", submit_credentials.id.clone());
    push("GLIDEIN_SCHEDD", job.schedd.clone());
    push("GLIDEIN_VERBOSITY", job.verbosity.clone());
    push("GLIDEIN_STARTUP_DIR", job.startup_dir.clone());
    push("GLIDEIN_SLOTS_LAYOUT", job.slots_layout.clone());
    push("GLIDEIN_IDLE_LIFETIME", idle_lifetime.to_string());
    push("GLIDEIN_LOGNR", today_lognr());
    push("GLIDEIN_NAME", glidein.glidein_name.clone());
    push("FACTORY_NAME", glidein.factory_name.clone());
    push("GLIDEIN_WEB_URL", glidein.web_url.clone());

    // sign_type has always been hardcoded
    let sign_type = "sha1";
    push("SIGN_TYPE", sign_type.to_string());
    push("MAIN_DESCRIPT", signatures.main_descript.clone());
    push("MAIN_SIGN", signatures.main_sign.clone());
    let (entry_sign, entry_descript) = signatures.entry(entry_name).ok_or_else(|| {
        FactoryError::ConfigError(format!("no signature recorded for entry {entry_name}"))
    })?;
    push("ENTRY_DESCRIPT", entry_descript.clone());
    push("ENTRY_SIGN", entry_sign.clone());

    let proxy_url = job.proxy_url.as_deref().unwrap_or("None");
    let mut glidein_arguments = format!(
        "-v {} -name {} -entry {} -clientname {} -schedd {} -proxy {} -factory {} -web {} \
         -sign {} -signentry {} -signtype {} -descript {} -descriptentry {} -dir {} \
         -param_GLIDEIN_Client {} -submitcredid {} -slotslayout {}{}",
        job.verbosity,
        glidein.glidein_name,
        entry_name,
        client_name,
        job.schedd,
        proxy_url,
        glidein.factory_name,
        glidein.web_url,
        signatures.main_sign,
        entry_sign,
        sign_type,
        signatures.main_descript,
        entry_descript,
        job.startup_dir,
        client_name,
        submit_credentials.id,
        job.slots_layout,
        params_str
    );
    glidein_arguments = glidein_arguments.replace('"', "\\\"");

    match &job.grid_type {
        GridType::Batch(_) => {
            push(
                "GRID_RESOURCE_OPTIONS",
                format!(
                    "--rgahp-key {} --rgahp-nopass",
                    sec_cred(submit_credentials, "PrivateKey")?
                ),
            );
            let glidein_proxy = sec_cred(submit_credentials, "GlideinProxy")?;
            push("X509_USER_PROXY", glidein_proxy.to_string());
            push(
                "X509_USER_PROXY_BASENAME",
                std::path::Path::new(glidein_proxy)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            );
            glidein_arguments.push_str(" -cluster $(Cluster) -subcluster $(Process)");
            // batch gateways choke on quoted argument blocks
            push("GLIDEIN_ARGUMENTS", glidein_arguments.clone());
        }
        GridType::Ec2 => {
            let glidein_proxy = sec_cred(submit_credentials, "GlideinProxy")?;
            push("X509_USER_PROXY", glidein_proxy.to_string());
            push("IMAGE_ID", id_cred(submit_credentials, "VMId")?.to_string());
            push(
                "INSTANCE_TYPE",
                id_cred(submit_credentials, "VMType")?.to_string(),
            );
            let access_key = sec_cred(submit_credentials, "PublicKey")?;
            push("ACCESS_KEY_FILE", access_key.to_string());
            push(
                "SECRET_KEY_FILE",
                sec_cred(submit_credentials, "PrivateKey")?.to_string(),
            );
            push(
                "CREDENTIAL_DIR",
                std::path::Path::new(access_key)
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default(),
            );
            let ini = userdata_ini(&glidein_arguments, &glidein.web_url, "EC2", params);
            push("USER_DATA", BASE64.encode(ini));
            push("GLIDEIN_PROXY_FNAME", glidein_proxy.to_string());
        }
        GridType::Gce => {
            let glidein_proxy = sec_cred(submit_credentials, "GlideinProxy")?;
            push("X509_USER_PROXY", glidein_proxy.to_string());
            let auth_file = sec_cred(submit_credentials, "AuthFile")?;
            push("GCE_AUTH_FILE", auth_file.to_string());
            push("GRID_RESOURCE_OPTIONS", format!("--auth-file {auth_file}"));
            let ini = userdata_ini(&glidein_arguments, &glidein.web_url, "GCE", params);
            push("USER_DATA", BASE64.encode(ini));
        }
        grid_type => {
            push(
                "X509_USER_PROXY",
                sec_cred(submit_credentials, "SubmitProxy")?.to_string(),
            );
            // the macros expand at submission time; cloud gateways never
            // see them, which is why they are added only here
            glidein_arguments.push_str(" -cluster $(Cluster) -subcluster $(Process)");
            if *grid_type == GridType::Condor {
                // condor_submit swallows the quote characters
                push("GLIDEIN_ARGUMENTS", glidein_arguments.clone());
            } else {
                push("GLIDEIN_ARGUMENTS", format!("\"{glidein_arguments}\""));
            }
            let glidein_rsl = job.rsl.clone().unwrap_or_default();
            push("GLIDEIN_RSL", glidein_rsl);
        }
    }

    Ok(exe_env)
}

/// Conservative pass-through of the parent environment for submissions that
/// run as a different local user.
pub fn parent_env_allowlist() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(k, _)| {
            matches!(k.as_str(), "PATH" | "LD_LIBRARY_PATH" | "X509_CERT_DIR")
                || k.starts_with("CONDOR_")
                || k.starts_with("_CONDOR_")
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::Path;

    pub fn test_glidein(dir: &Path) -> GlideinDescript {
        GlideinDescript {
            factory_name: "factory".to_string(),
            glidein_name: "v1_0".to_string(),
            web_url: "http://web/stage".to_string(),
            rsa_key_file: dir.join("rsa.key"),
            supported_signtypes: vec!["sha1".to_string()],
            advertise_use_tcp: false,
            advertise_use_multi: false,
            factory_collector: None,
            factory_proxy: None,
            lock_dir: dir.to_path_buf(),
            submit_dir: dir.to_path_buf(),
            client_proxies_base_dir: dir.to_path_buf(),
            num_factories: 1,
            entries: vec!["osg_test".to_string()],
            tuning: Default::default(),
            stale_ages: Default::default(),
        }
    }

    pub fn test_signatures() -> SignatureFile {
        let mut signatures = SignatureFile {
            main_sign: "mainsig".to_string(),
            main_descript: "description.cfg".to_string(),
            ..Default::default()
        };
        signatures.add_entry("osg_test", "entrysig", "entry_description.cfg");
        signatures
    }

    fn proxy_creds(dir: &Path) -> SubmitCredentials {
        let proxy = dir.join("proxy.pem");
        std::fs::write(&proxy, "proxy").unwrap();
        let mut creds = SubmitCredentials::new("fecms", "frontend");
        creds.id = "cred1".to_string();
        creds.add_factory_credential("SubmitProxy", &proxy);
        creds
    }

    #[test]
    fn env_carries_the_pilot_contract() {
        let dir = tempfile::TempDir::new().unwrap();
        let glidein = test_glidein(dir.path());
        let job = crate::entry::totals::tests::test_job_descript();
        let creds = proxy_creds(dir.path());

        let env = get_submit_environment(
            &glidein,
            &job,
            &test_signatures(),
            "client1",
            &creds,
            None,
            &Map::new(),
            7200,
        )
        .unwrap();
        let env: Map<String, String> = env.into_iter().collect();

        assert_eq!(env["GLIDEIN_ENTRY_NAME"], "osg_test");
        assert_eq!(env["GLIDEIN_CLIENT"], "client1");
        assert_eq!(env["GLIDEIN_SEC_CLASS"], "frontend");
        assert_eq!(env["GLIDEIN_USER"], "fecms");
        assert_eq!(env["GLIDEIN_CREDENTIAL_ID"], "cred1");
        assert_eq!(env["GLIDEIN_SCHEDD"], "schedd1");
        assert_eq!(env["GLIDEIN_IDLE_LIFETIME"], "7200");
        assert_eq!(env["SIGN_TYPE"], "sha1");
        assert_eq!(env["MAIN_SIGN"], "mainsig");
        assert_eq!(env["ENTRY_SIGN"], "entrysig");
        assert_eq!(env["GLIDEIN_WEB_URL"], "http://web/stage");
        assert_eq!(env["GLIDEIN_LOGNR"].len(), 8);
        assert!(env["X509_USER_PROXY"].ends_with("proxy.pem"));

        let args = &env["GLIDEIN_ARGUMENTS"];
        assert!(args.contains("-entry osg_test"));
        assert!(args.contains("-submitcredid cred1"));
        assert!(args.contains("-cluster $(Cluster) -subcluster $(Process)"));
    }

    #[test]
    fn params_are_escaped_into_the_argument_pack() {
        let dir = tempfile::TempDir::new().unwrap();
        let glidein = test_glidein(dir.path());
        let job = crate::entry::totals::tests::test_job_descript();
        let creds = proxy_creds(dir.path());
        let mut params = Map::new();
        params.insert("GLIDECLIENT_Rank".to_string(), "a b".to_string());
        params.insert("Empty".to_string(), "  ".to_string());

        let env = get_submit_environment(
            &glidein,
            &job,
            &test_signatures(),
            "client1",
            &creds,
            None,
            &params,
            0,
        )
        .unwrap();
        let env: Map<String, String> = env.into_iter().collect();
        let args = &env["GLIDEIN_ARGUMENTS"];
        assert!(args.contains("-param_GLIDECLIENT_Rank a.nbsp,b"));
        assert!(!args.contains("-param_Empty"));
    }

    #[test]
    fn ec2_env_carries_the_userdata_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let glidein = test_glidein(dir.path());
        let mut job = crate::entry::totals::tests::test_job_descript();
        job.grid_type = GridType::Ec2;
        job.auth_method = "key_pair".to_string();

        let pubkey = dir.path().join("access.key");
        let privkey = dir.path().join("secret.key");
        let proxy = dir.path().join("pilot.proxy");
        for p in [&pubkey, &privkey, &proxy] {
            std::fs::write(p, "x").unwrap();
        }
        let mut creds = SubmitCredentials::new("fecms", "frontend");
        creds.id = "cloudcred".to_string();
        creds.add_factory_credential("PublicKey", &pubkey);
        creds.add_factory_credential("PrivateKey", &privkey);
        creds.add_factory_credential("GlideinProxy", &proxy);
        creds.add_identity_credential("VMId", "ami-123");
        creds.add_identity_credential("VMType", "m1.large");

        let mut params = Map::new();
        params.insert("VM_MAX_LIFETIME".to_string(), "600".to_string());

        let env = get_submit_environment(
            &glidein,
            &job,
            &test_signatures(),
            "client1",
            &creds,
            None,
            &params,
            0,
        )
        .unwrap();
        let env: Map<String, String> = env.into_iter().collect();

        assert_eq!(env["IMAGE_ID"], "ami-123");
        assert_eq!(env["INSTANCE_TYPE"], "m1.large");
        assert!(env["CREDENTIAL_DIR"].ends_with(dir.path().to_str().unwrap()));
        let ini = String::from_utf8(BASE64.decode(&env["USER_DATA"]).unwrap()).unwrap();
        assert!(ini.contains("max_lifetime = 600"));
        assert!(ini.contains("contextualization_type = EC2"));
        assert!(ini.contains("disable_shutdown = False"));
        // cloud arguments never carry the submit-time macros
        assert!(!ini.contains("$(Cluster)"));
    }

    #[test]
    fn client_web_args_are_prepended() {
        let dir = tempfile::TempDir::new().unwrap();
        let glidein = test_glidein(dir.path());
        let job = crate::entry::totals::tests::test_job_descript();
        let creds = proxy_creds(dir.path());
        let web = ClientWeb::new(
            &glidein,
            "http://fe/web",
            "sha1",
            "fe_descript",
            "fesig",
            "main",
            "http://fe/web/group",
            "group_descript",
            "groupsig",
        )
        .unwrap();

        let env = get_submit_environment(
            &glidein,
            &job,
            &test_signatures(),
            "client1",
            &creds,
            Some(&web),
            &Map::new(),
            0,
        )
        .unwrap();
        let env: Map<String, String> = env.into_iter().collect();
        assert!(env["GLIDEIN_ARGUMENTS"].contains("-clientweb http://fe/web"));
        assert!(env["GLIDEIN_ARGUMENTS"].contains("-clientsigngroup groupsig"));

        assert!(ClientWeb::new(
            &glidein,
            "u",
            "md5",
            "d",
            "s",
            "g",
            "gu",
            "gd",
            "gs"
        )
        .is_err());
    }
}
