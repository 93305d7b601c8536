//! Frontend credential intake and on-disk materialization.
//!
//! Every `glideclientglobal` classad carries N encrypted credential blobs
//! plus one encrypted security class per blob. After the session key is
//! unsealed and the identity claim verified, each blob lands under
//! `user_<username>/glidein_<glidein>/credential_<client>_<escaped_id>`
//! through the write-new/backup-old/rename protocol, so pilots reading the
//! file never observe a torn update.

pub mod crypto;

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;

use crate::classad::ClassAd;
use crate::common::error::FactoryError;
use crate::common::fsutils;
use crate::config::{FrontendDescript, GlideinDescript};
use crate::{Map, Result};
use crypto::{FactoryKey, SymKey};

pub const SUPPORTED_AUTH_METHODS: &[&str] = &[
    "grid_proxy",
    "cert_pair",
    "key_pair",
    "auth_file",
    "username_password",
    "idtoken",
    "scitoken",
];

fn cred_err(msg: impl Into<String>) -> FactoryError {
    FactoryError::CredentialError(msg.into())
}

/// Escape table applied to client-supplied credential ids before they become
/// file name components.
const ESCAPE_TABLE: &[(char, &str)] = &[
    ('.', ".dot,"),
    (',', ".comma,"),
    ('&', ".amp,"),
    ('\\', ".backslash,"),
    ('|', ".pipe,"),
    ('`', ".fork,"),
    ('"', ".quot,"),
    ('\'', ".singquot,"),
    ('=', ".eq,"),
    ('+', ".plus,"),
    ('-', ".minus,"),
    ('<', ".lt,"),
    ('>', ".gt,"),
    ('(', ".open,"),
    (')', ".close,"),
    ('{', ".gopen,"),
    ('}', ".gclose,"),
    ('[', ".sopen,"),
    (']', ".sclose,"),
    ('#', ".comment,"),
    ('$', ".dollar,"),
    ('*', ".star,"),
    ('?', ".question,"),
    ('!', ".not,"),
    ('~', ".tilde,"),
    (':', ".colon,"),
    (';', ".semicolon,"),
    (' ', ".nbsp,"),
];

pub fn escape_param(param: &str) -> String {
    let mut out = String::with_capacity(param.len());
    for c in param.chars() {
        match ESCAPE_TABLE.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => out.push_str(to),
            None => out.push(c),
        }
    }
    out
}

/// Only plain names may become part of a path.
pub fn is_str_safe(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
}

/// Everything needed to submit pilots on behalf of one request.
#[derive(Debug, Clone)]
pub struct SubmitCredentials {
    pub username: String,
    pub security_class: String,
    /// Credential id used for tracking in the queue.
    pub id: String,
    pub cred_dir: PathBuf,
    /// Credential kind -> on-disk file.
    pub security_credentials: Map<String, PathBuf>,
    /// Identity information passed by value (VM ids, project ids, tokens).
    pub identity_credentials: Map<String, String>,
}

impl SubmitCredentials {
    pub fn new(username: &str, security_class: &str) -> SubmitCredentials {
        SubmitCredentials {
            username: username.to_string(),
            security_class: security_class.to_string(),
            id: String::new(),
            cred_dir: PathBuf::new(),
            security_credentials: Map::new(),
            identity_credentials: Map::new(),
        }
    }

    /// Bind a frontend-supplied credential file; the name must already be
    /// the `<client>_<escaped_id>` composite.
    pub fn add_security_credential(&mut self, cred_type: &str, filename: &str) -> bool {
        if !is_str_safe(filename) {
            return false;
        }
        let cred_fname = self.cred_dir.join(format!("credential_{filename}"));
        if !cred_fname.is_file() {
            return false;
        }
        self.security_credentials
            .insert(cred_type.to_string(), cred_fname);
        true
    }

    /// Bind a factory-owned credential by absolute path.
    pub fn add_factory_credential(&mut self, cred_type: &str, absfname: &Path) -> bool {
        if !absfname.is_file() {
            return false;
        }
        self.security_credentials
            .insert(cred_type.to_string(), absfname.to_path_buf());
        true
    }

    pub fn add_identity_credential(&mut self, cred_type: &str, value: &str) {
        self.identity_credentials
            .insert(cred_type.to_string(), value.to_string());
    }

    pub fn security_credential(&self, cred_type: &str) -> Option<&Path> {
        self.security_credentials.get(cred_type).map(|p| p.as_path())
    }

    pub fn identity_credential(&self, cred_type: &str) -> Option<&str> {
        self.identity_credentials.get(cred_type).map(|s| s.as_str())
    }
}

/// gzip + base64 of the raw credential bytes.
pub fn compress_credential(credential_data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(credential_data)
        .map_err(|e| cred_err(format!("cannot compress credential: {e}")))?;
    let gz = encoder
        .finish()
        .map_err(|e| cred_err(format!("cannot compress credential: {e}")))?;
    Ok(BASE64.encode(gz).into_bytes())
}

/// Write the raw credential and its compressed sibling.
///
/// Returns `(credential_path, compressed_path)`.
pub fn update_credential_file(
    glidein: &GlideinDescript,
    username: &str,
    client_id: &str,
    credential_data: &[u8],
    request_clientname: &str,
) -> Result<(PathBuf, PathBuf)> {
    let proxy_dir = glidein.client_proxies_dir(username);
    fsutils::ensure_dir(&proxy_dir)?;

    let fname_short = format!(
        "credential_{request_clientname}_{}",
        escape_param(client_id)
    );
    let fname = proxy_dir.join(&fname_short);
    let fname_compressed = fsutils::with_suffix(&fname, "_compressed");
    let fname_mapped_idtoken = fsutils::with_suffix(&fname, "_idtoken");

    log::debug!("Updating credential file {}", fname.display());
    fsutils::safe_update(&fname, credential_data)?;

    let compressed = compress_credential(credential_data)?;
    let payload = if fname_mapped_idtoken.is_file() {
        let idtoken = std::fs::read(&fname_mapped_idtoken)?;
        let mut body = idtoken;
        body.extend_from_slice(b"####glidein_credentials=");
        body.extend_from_slice(&compressed);
        body
    } else {
        compressed
    };
    fsutils::safe_update(&fname_compressed, &payload)?;

    Ok((fname, fname_compressed))
}

/// Unseal the session key from `ReqEncKeyCode`.
pub fn get_key_obj(key: &FactoryKey, classad: &ClassAd) -> Result<SymKey> {
    match classad.get_str("ReqEncKeyCode") {
        Some(code) => key.extract_sym_key(code),
        None => Err(cred_err(
            "Classad does not contain a key. We cannot decrypt.".to_string(),
        )),
    }
}

/// Verify the classad's identity claims and return the session key plus the
/// frontend security name.
///
/// Three checks in order: the decrypted `ReqEncIdentity` must equal the
/// bus-authenticated identity, the decrypted security name must belong to a
/// known frontend, and that frontend's expected identity must match the
/// authenticated one.
pub fn validate_frontend(
    classad: &ClassAd,
    frontends: &FrontendDescript,
    key: &FactoryKey,
) -> Result<(SymKey, String)> {
    let sym_key = get_key_obj(key, classad)?;
    let authenticated_identity = classad
        .get_str("AuthenticatedIdentity")
        .ok_or_else(|| cred_err("classad carries no AuthenticatedIdentity".to_string()))?;

    let enc_identity = classad
        .get_str("ReqEncIdentity")
        .ok_or_else(|| cred_err("classad carries no ReqEncIdentity".to_string()))?;
    let claimed_identity = sym_key
        .decrypt_hex_string(enc_identity)
        .map_err(|_| cred_err("Cannot decrypt ReqEncIdentity.".to_string()))?;
    if claimed_identity != authenticated_identity {
        return Err(cred_err(format!(
            "Client provided invalid ReqEncIdentity({claimed_identity}!={authenticated_identity}). \
             Skipping for security reasons."
        )));
    }

    let enc_sec_name = classad
        .get_str("GlideinEncParamSecurityName")
        .ok_or_else(|| cred_err("classad carries no GlideinEncParamSecurityName".to_string()))?;
    let frontend_sec_name = sym_key
        .decrypt_hex_string(enc_sec_name)
        .map_err(|_| cred_err("Cannot decrypt GlideinEncParamSecurityName.".to_string()))?;

    let expected_identity = frontends.get_identity(&frontend_sec_name).ok_or_else(|| {
        cred_err(format!(
            "This frontend is not authorized by the factory. Supplied security name: \
             {frontend_sec_name}"
        ))
    })?;
    if authenticated_identity != expected_identity {
        return Err(cred_err(
            "This frontend's authenticated identity does not match the expected identity"
                .to_string(),
        ));
    }

    Ok((sym_key, frontend_sec_name))
}

/// Process one `glideclientglobal` classad: decrypt every credential blob it
/// carries and materialize each on disk.
///
/// Returns the number of credential files updated. A missing
/// `(security_name, security_class)` mapping skips that credential only.
pub fn process_global(
    classad: &ClassAd,
    glidein: &GlideinDescript,
    frontends: &FrontendDescript,
    key: &FactoryKey,
) -> Result<usize> {
    let (sym_key, frontend_sec_name) = validate_frontend(classad, frontends, key)?;

    let request_clientname = classad
        .get_str("ClientName")
        .ok_or_else(|| cred_err("classad carries no ClientName".to_string()))?;

    let class_re = Regex::new("^GlideinEncParamSecurityClass(.*)$").expect("static regex");
    let mut updated = 0;
    for attr in classad.attr_names() {
        let Some(caps) = class_re.captures(attr) else {
            continue;
        };
        let cred_id = &caps[1];
        if cred_id.is_empty() {
            continue;
        }
        let enc_data = classad
            .get_str(&format!("GlideinEncParam{cred_id}"))
            .ok_or_else(|| cred_err(format!("credential {cred_id} has no payload attribute")))?;
        let cred_data = sym_key.decrypt_hex(enc_data)?;
        let security_class = sym_key.decrypt_hex_string(
            classad
                .get_str(attr)
                .expect("attribute name came from this classad"),
        )?;

        let Some(username) = frontends.get_username(&frontend_sec_name, &security_class) else {
            log::error!(
                "Cannot find a mapping for credential {cred_id} of client {request_clientname}. \
                 Skipping it. The security class field is set to {security_class} in the frontend. \
                 Please verify the configuration and make sure it is mapped correctly"
            );
            continue;
        };

        log::debug!("Updating credential {cred_id} for {username}");
        update_credential_file(glidein, username, cred_id, &cred_data, request_clientname)?;
        updated += 1;
    }
    Ok(updated)
}

/// Verify that the decrypted request parameters carry exactly the
/// credentials its entry's authentication method requires, and nothing else.
pub fn check_security_credentials(
    auth_method: &str,
    params: &Map<String, String>,
    client_int_name: &str,
    entry_name: &str,
) -> Result<()> {
    let auth_methods: Vec<&str> = auth_method.split('+').collect();
    if !auth_methods
        .iter()
        .any(|m| SUPPORTED_AUTH_METHODS.contains(m))
    {
        log::warn!(
            "None of the supported auth methods {SUPPORTED_AUTH_METHODS:?} in provided auth \
             methods: {auth_methods:?}"
        );
        return Ok(());
    }

    const RELEVANT_KEYS: &[&str] = &[
        "SubmitProxy",
        "GlideinProxy",
        "Username",
        "Password",
        "PublicCert",
        "PrivateCert",
        "PublicKey",
        "PrivateKey",
        "VMId",
        "VMType",
        "AuthFile",
    ];

    let reject_invalid = |valid_keys: &[&str]| -> Result<()> {
        let bad: Vec<&str> = params
            .keys()
            .map(|k| k.as_str())
            .filter(|k| RELEVANT_KEYS.contains(k) && !valid_keys.contains(k))
            .collect();
        if bad.is_empty() {
            Ok(())
        } else {
            Err(cred_err(format!(
                "Request from {client_int_name} has credentials not required by the entry \
                 {entry_name}, skipping request"
            )))
        }
    };

    if auth_methods.contains(&"scitoken") {
        // The token itself travels in the identity credentials; no
        // security credential params are expected alongside it.
        return reject_invalid(&["VMId", "VMType"]);
    }

    if auth_methods.contains(&"grid_proxy") {
        if !params.contains_key("SubmitProxy") {
            return Err(cred_err(format!(
                "Request from client {client_int_name} did not provide a proxy as required by \
                 the entry {entry_name}, skipping request"
            )));
        }
        return reject_invalid(&["SubmitProxy"]);
    }

    // Only the proxy-less methods remain; all of them ride on the glidein
    // proxy for the pilot itself.
    if !params.contains_key("GlideinProxy") {
        return Err(cred_err(format!(
            "Glidein proxy cannot be found for client {client_int_name}, skipping request"
        )));
    }

    if auth_methods.contains(&"cert_pair") {
        if !(params.contains_key("PublicCert") && params.contains_key("PrivateCert")) {
            return Err(cred_err(format!(
                "Client '{client_int_name}' did not specify the certificate pair in the request, \
                 this is required by entry {entry_name}, skipping"
            )));
        }
        reject_invalid(&["GlideinProxy", "PublicCert", "PrivateCert", "VMId", "VMType"])
    } else if auth_methods.contains(&"key_pair") {
        if !(params.contains_key("PublicKey") && params.contains_key("PrivateKey")) {
            return Err(cred_err(format!(
                "Client '{client_int_name}' did not specify the key pair in the request, this is \
                 required by entry {entry_name}, skipping"
            )));
        }
        reject_invalid(&["GlideinProxy", "PublicKey", "PrivateKey", "VMId", "VMType"])
    } else if auth_methods.contains(&"auth_file") {
        if !params.contains_key("AuthFile") {
            return Err(cred_err(format!(
                "Client '{client_int_name}' did not specify the auth_file in the request, this is \
                 required by entry {entry_name}, skipping"
            )));
        }
        reject_invalid(&["GlideinProxy", "AuthFile", "VMId", "VMType"])
    } else if auth_methods.contains(&"username_password") {
        if !(params.contains_key("Username") && params.contains_key("Password")) {
            return Err(cred_err(format!(
                "Client '{client_int_name}' did not specify the username and password in the \
                 request, this is required by entry {entry_name}, skipping"
            )));
        }
        reject_invalid(&["GlideinProxy", "Username", "Password", "VMId", "VMType"])
    } else {
        Err(cred_err(
            "Inconsistency between SUPPORTED_AUTH_METHODS and check_security_credentials"
                .to_string(),
        ))
    }
}
