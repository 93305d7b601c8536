//! Retrieval and decoding of frontend work requests (`glideclient` ads).

use crate::advertise::{CLIENT_ID, ENC_PARAM_PREFIX, MONITOR_PREFIX, PARAM_PREFIX, REQ_PREFIX, WEB_PREFIX};
use crate::classad::{AdValue, ClassAd};
use crate::collector::BusClient;
use crate::config::GlideinDescript;
use crate::creds::crypto::FactoryKey;
use crate::entry::reconcile::{RemoveExcess, RemoveExcessMode};
use crate::{Map, Result};

/// Attributes that never land in the prefix-split namespaces.
const RESERVED_NAMES: &[&str] = &[
    "ReqName",
    "ReqGlidein",
    "ClientName",
    "FrontendName",
    "GroupName",
    "ReqPubKeyID",
    "ReqEncKeyCode",
    "ReqEncIdentity",
    "AuthenticatedIdentity",
];

/// One decoded frontend request.
#[derive(Debug, Clone, Default)]
pub struct WorkRequest {
    /// Classad `Name`: the client (frontend group) name.
    pub name: String,
    /// Internal client name (`ClientName`).
    pub client_int_name: String,
    /// Request name (`ReqName`), `entry@glidein@factory`.
    pub req_name: String,
    pub frontend_name: String,
    pub group_name: String,
    pub authenticated_identity: Option<String>,
    /// `Req*` fields minus the reserved ones, keyed without the prefix.
    pub requests: Map<String, AdValue>,
    /// `Web*` staging block, keyed without the prefix.
    pub web: Map<String, AdValue>,
    /// `GlideinParam*` parameters forwarded to the pilot.
    pub params: Map<String, String>,
    /// `GlideinMonitor*` counters from the client.
    pub monitor: Map<String, AdValue>,
    /// Decrypted `GlideinEncParam*` values.
    pub params_decrypted: Map<String, String>,
}

impl WorkRequest {
    fn req_int(&self, name: &str) -> Option<i64> {
        match self.requests.get(name) {
            Some(AdValue::Int(v)) => Some(*v),
            Some(AdValue::Str(s)) | Some(AdValue::Expr(s)) => s.parse().ok(),
            None => None,
        }
    }

    fn req_str(&self, name: &str) -> Option<&str> {
        self.requests.get(name).and_then(|v| v.as_str())
    }

    pub fn min_idle(&self) -> i64 {
        self.req_int("IdleGlideins").unwrap_or(0)
    }

    pub fn max_glideins(&self) -> i64 {
        self.req_int("MaxGlideins").unwrap_or(0)
    }

    pub fn idle_lifetime(&self) -> i64 {
        self.req_int("IdleLifetime").unwrap_or(0)
    }

    /// The `(mode, margin, frontend_min_idle)` removal directive.
    pub fn remove_excess(&self) -> RemoveExcess {
        RemoveExcess {
            mode: RemoveExcessMode::parse(self.req_str("RemoveExcess").unwrap_or("NO")),
            margin: self.req_int("RemoveExcessMargin").unwrap_or(0),
            frontend_min_idle: self.min_idle(),
        }
    }

    pub fn decrypted(&self, name: &str) -> Option<&str> {
        self.params_decrypted.get(name).map(|s| s.as_str())
    }
}

fn split_prefixed(kel: &ClassAd, prefix: &str) -> Map<String, AdValue> {
    let mut out = Map::new();
    for (attr, value) in kel.iter() {
        if RESERVED_NAMES.contains(&attr) {
            continue;
        }
        if let Some(rest) = attr.strip_prefix(prefix) {
            out.insert(rest.to_string(), value.clone());
        }
    }
    out
}

/// Decode one `glideclient` record; `None` drops it (already logged).
fn decode_request(name: &str, kel: &ClassAd, pub_key: Option<&FactoryKey>) -> Option<WorkRequest> {
    let mut el = WorkRequest {
        name: name.to_string(),
        client_int_name: kel.get_str("ClientName").unwrap_or(name).to_string(),
        req_name: kel.get_str("ReqName").unwrap_or_default().to_string(),
        frontend_name: kel.get_str("FrontendName").unwrap_or_default().to_string(),
        group_name: kel.get_str("GroupName").unwrap_or_default().to_string(),
        authenticated_identity: kel.get_str("AuthenticatedIdentity").map(|s| s.to_string()),
        requests: split_prefixed(kel, REQ_PREFIX),
        web: split_prefixed(kel, WEB_PREFIX),
        params: split_prefixed(kel, PARAM_PREFIX)
            .into_iter()
            .map(|(k, v)| (k, v.key_string()))
            .collect(),
        monitor: split_prefixed(kel, MONITOR_PREFIX),
        params_decrypted: Map::new(),
    };

    let sym_key = match (pub_key, kel.get_str("ReqPubKeyID")) {
        (Some(key), Some(_)) => {
            let code = kel.get_str("ReqEncKeyCode")?;
            match key.extract_sym_key(code) {
                Ok(sym) => Some(sym),
                Err(_) => {
                    log::warn!("Client {name} provided an unusable ReqEncKeyCode. Skipping.");
                    return None;
                }
            }
        }
        _ => None,
    };

    if let Some(sym_key) = &sym_key {
        // The identity the client claims to be must be the identity the
        // bus authenticated.
        let enc_identity = kel.get_str("ReqEncIdentity")?;
        let claimed = match sym_key.decrypt_hex_string(enc_identity) {
            Ok(claimed) => claimed,
            Err(_) => {
                log::warn!(
                    "Client {name} provided invalid ReqEncIdentity, could not decode. Skipping \
                     for security reasons."
                );
                return None;
            }
        };
        let authenticated = kel.get_str("AuthenticatedIdentity").unwrap_or_default();
        if claimed != authenticated {
            log::warn!(
                "Client {name} provided invalid ReqEncIdentity({claimed}!={authenticated}). \
                 Skipping for security reasons."
            );
            return None;
        }

        for (attr, value) in kel.iter() {
            if RESERVED_NAMES.contains(&attr) {
                continue;
            }
            let Some(rest) = attr.strip_prefix(ENC_PARAM_PREFIX) else {
                continue;
            };
            let Some(ciphertext) = value.as_str() else {
                continue;
            };
            match sym_key.decrypt_hex_string(ciphertext) {
                Ok(plain) => {
                    el.params_decrypted.insert(rest.to_string(), plain);
                }
                Err(_) => {
                    log::warn!(
                        "At least one of the encrypted parameters for client {name} cannot be \
                         decoded. Skipping for security reasons."
                    );
                    return None;
                }
            }
        }
    }

    Some(el)
}

/// Query the bus for this factory's work requests and group them by entry.
///
/// Returns `work[entry_name][client_name]`.
pub async fn find_group_work(
    bus: &dyn BusClient,
    glidein: &GlideinDescript,
    entry_names: &[String],
    pub_key: Option<&FactoryKey>,
) -> Result<Map<String, Map<String, WorkRequest>>> {
    let req_glideins = entry_names
        .iter()
        .map(|entry| format!("{entry}@{}@{}", glidein.glidein_name, glidein.factory_name))
        .collect::<Vec<_>>()
        .join(",");

    let mut constraint = format!(
        "(GlideinMyType=?=\"{CLIENT_ID}\") && (stringListMember(ReqGlidein,\"{req_glideins}\")=?=True)"
    );
    constraint.push_str(&format!(
        " && stringListMember(WebSignType,\"{}\")",
        glidein.supported_signtypes.join(",")
    ));
    if let Some(key) = pub_key {
        // Only classads sealed for my key (or not sealed at all) are usable.
        constraint.push_str(&format!(
            " && (((ReqPubKeyID=?=\"{}\") && (ReqEncKeyCode=!=Undefined) && \
             (ReqEncIdentity=!=Undefined)) || (ReqPubKeyID=?=Undefined))",
            key.key_id()
        ));
    }

    let records = bus.query_ads(&constraint, Some(true)).await?;
    let folded = crate::classad::fold_by_key(records, &["Name"]);

    let mut grouped: Map<String, Map<String, WorkRequest>> = Map::new();
    for (key, kel) in folded {
        let Some(name) = key.first() else {
            continue;
        };
        let Some(work) = decode_request(name, &kel, pub_key) else {
            continue;
        };
        let Some((entry, _)) = work.req_name.split_once('@') else {
            log::warn!(
                "Unable to group work for '{name}' based on ReqName '{}'. This work item will \
                 not be processed.",
                work.req_name
            );
            continue;
        };
        grouped
            .entry(entry.to_string())
            .or_default()
            .insert(name.clone(), work);
    }
    Ok(grouped)
}

/// Query the bus for the `glideclientglobal` credential ads.
pub async fn find_global_work(bus: &dyn BusClient) -> Result<Vec<ClassAd>> {
    let constraint = format!("(GlideinMyType=?=\"{}\")", crate::advertise::CLIENT_GLOBAL_ID);
    bus.query_ads(&constraint, Some(true)).await
}
