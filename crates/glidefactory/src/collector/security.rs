//! Security policy pushed to the collector tools through the process
//! environment (`_CONDOR_SEC_<CONTEXT>_<AXIS>` variables).

use std::fmt;

use crate::common::error::FactoryError;
use crate::{Map, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecContext {
    Default,
    Administrator,
    Negotiator,
    Client,
    Owner,
    Read,
    Write,
    Daemon,
    Config,
    AdvertiseMaster,
    AdvertiseStartd,
    AdvertiseSchedd,
}

impl SecContext {
    pub const ALL: [SecContext; 12] = [
        SecContext::Default,
        SecContext::Administrator,
        SecContext::Negotiator,
        SecContext::Client,
        SecContext::Owner,
        SecContext::Read,
        SecContext::Write,
        SecContext::Daemon,
        SecContext::Config,
        SecContext::AdvertiseMaster,
        SecContext::AdvertiseStartd,
        SecContext::AdvertiseSchedd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SecContext::Default => "DEFAULT",
            SecContext::Administrator => "ADMINISTRATOR",
            SecContext::Negotiator => "NEGOTIATOR",
            SecContext::Client => "CLIENT",
            SecContext::Owner => "OWNER",
            SecContext::Read => "READ",
            SecContext::Write => "WRITE",
            SecContext::Daemon => "DAEMON",
            SecContext::Config => "CONFIG",
            SecContext::AdvertiseMaster => "ADVERTISE_MASTER",
            SecContext::AdvertiseStartd => "ADVERTISE_STARTD",
            SecContext::AdvertiseSchedd => "ADVERTISE_SCHEDD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecAxis {
    Authentication,
    Integrity,
    Encryption,
    Negotiation,
}

impl SecAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecAxis::Authentication => "AUTHENTICATION",
            SecAxis::Integrity => "INTEGRITY",
            SecAxis::Encryption => "ENCRYPTION",
            SecAxis::Negotiation => "NEGOTIATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecValue {
    Never,
    Optional,
    Preferred,
    Required,
    /// Sentinel: remove the variable so the tool default applies.
    Unset,
}

impl SecValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecValue::Never => "NEVER",
            SecValue::Optional => "OPTIONAL",
            SecValue::Preferred => "PREFERRED",
            SecValue::Required => "REQUIRED",
            SecValue::Unset => "UNSET",
        }
    }
}

impl fmt::Display for SecValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn env_key(context: SecContext, axis: SecAxis) -> String {
    format!("_CONDOR_SEC_{}_{}", context.as_str(), axis.as_str())
}

/// A set of security requests over the context x axis matrix, enforced on
/// the process environment around each tool invocation.
///
/// `save_state` / `restore_state` must nest exactly once; the bus client
/// wraps every invocation in that pair while holding the bus mutex.
#[derive(Default)]
pub struct SecEnvRequest {
    requests: Map<(SecContext, SecAxis), SecValue>,
    /// Credential handed to the tool via `X509_USER_PROXY`.
    x509_proxy: Option<String>,
    saved_state: Option<Vec<(String, Option<String>)>>,
}

impl SecEnvRequest {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record a request; `None` drops any previous request for the slot.
    pub fn set(&mut self, context: SecContext, axis: SecAxis, value: Option<SecValue>) {
        match value {
            Some(v) => {
                self.requests.insert((context, axis), v);
            }
            None => {
                self.requests.remove(&(context, axis));
            }
        }
    }

    pub fn get(&self, context: SecContext, axis: SecAxis) -> Option<SecValue> {
        self.requests.get(&(context, axis)).copied()
    }

    /// Shorthand used by queries: integrity of the CLIENT context.
    /// `true` -> REQUIRED, `false` -> OPTIONAL.
    pub fn require_integrity(&mut self, required: Option<bool>) {
        let value = required.map(|r| {
            if r {
                SecValue::Required
            } else {
                SecValue::Optional
            }
        });
        self.set(SecContext::Client, SecAxis::Integrity, value);
    }

    pub fn require_encryption(&mut self, required: Option<bool>) {
        let value = required.map(|r| {
            if r {
                SecValue::Required
            } else {
                SecValue::Optional
            }
        });
        self.set(SecContext::Client, SecAxis::Encryption, value);
    }

    pub fn set_x509_proxy(&mut self, proxy: Option<String>) {
        self.x509_proxy = proxy;
    }

    pub fn has_saved_state(&self) -> bool {
        self.saved_state.is_some()
    }

    /// Remember the environment slots this request may touch.
    pub fn save_state(&mut self) -> Result<()> {
        if self.has_saved_state() {
            return Err(FactoryError::BusError(
                "There is already a saved state! Restore that first.".to_string(),
            ));
        }
        let mut saved = Vec::with_capacity(self.requests.len() + 1);
        for (context, axis) in self.requests.keys() {
            let key = env_key(*context, *axis);
            let old = std::env::var(&key).ok();
            saved.push((key, old));
        }
        if self.x509_proxy.is_some() {
            saved.push(("X509_USER_PROXY".to_string(), std::env::var("X509_USER_PROXY").ok()));
        }
        self.saved_state = Some(saved);
        Ok(())
    }

    /// Write the requested values into the environment.
    pub fn enforce_requests(&self) {
        for ((context, axis), value) in &self.requests {
            let key = env_key(*context, *axis);
            match value {
                SecValue::Unset => unsafe { std::env::remove_var(&key) },
                v => unsafe { std::env::set_var(&key, v.as_str()) },
            }
        }
        if let Some(proxy) = &self.x509_proxy {
            unsafe { std::env::set_var("X509_USER_PROXY", proxy) };
        }
    }

    /// Put the saved slots back; a missing saved state is a no-op.
    pub fn restore_state(&mut self) {
        let Some(saved) = self.saved_state.take() else {
            return;
        };
        for (key, old) in saved {
            match old {
                Some(v) => unsafe { std::env::set_var(&key, v) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_save_is_rejected() {
        let mut req = SecEnvRequest::new();
        req.set(
            SecContext::Client,
            SecAxis::Integrity,
            Some(SecValue::Required),
        );
        req.save_state().unwrap();
        assert!(req.save_state().is_err());
        req.restore_state();
        req.save_state().unwrap();
        req.restore_state();
    }

    #[test]
    fn enforce_and_restore_roundtrip() {
        let key = "_CONDOR_SEC_ADVERTISE_STARTD_NEGOTIATION";
        unsafe { std::env::remove_var(key) };

        let mut req = SecEnvRequest::new();
        req.set(
            SecContext::AdvertiseStartd,
            SecAxis::Negotiation,
            Some(SecValue::Preferred),
        );
        req.save_state().unwrap();
        req.enforce_requests();
        assert_eq!(std::env::var(key).unwrap(), "PREFERRED");
        req.restore_state();
        assert!(std::env::var(key).is_err());
    }

    #[test]
    fn unset_sentinel_removes_variable() {
        let key = "_CONDOR_SEC_CONFIG_ENCRYPTION";
        unsafe { std::env::set_var(key, "REQUIRED") };

        let mut req = SecEnvRequest::new();
        req.set(
            SecContext::Config,
            SecAxis::Encryption,
            Some(SecValue::Unset),
        );
        req.save_state().unwrap();
        req.enforce_requests();
        assert!(std::env::var(key).is_err());
        req.restore_state();
        assert_eq!(std::env::var(key).unwrap(), "REQUIRED");
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn require_integrity_maps_to_client_context() {
        let mut req = SecEnvRequest::new();
        req.require_integrity(Some(true));
        assert_eq!(
            req.get(SecContext::Client, SecAxis::Integrity),
            Some(SecValue::Required)
        );
        req.require_integrity(Some(false));
        assert_eq!(
            req.get(SecContext::Client, SecAxis::Integrity),
            Some(SecValue::Optional)
        );
        req.require_integrity(None);
        assert_eq!(req.get(SecContext::Client, SecAxis::Integrity), None);
    }
}
