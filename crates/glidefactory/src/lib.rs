pub mod advertise;
pub mod classad;
pub mod collector;
pub mod common;
pub mod config;
pub mod creds;
pub mod entry;
pub mod queue;
pub mod schedd;
pub mod submit;

pub type Error = crate::common::error::FactoryError;
pub type Result<T> = std::result::Result<T, Error>;

/// Map alias used throughout the crate.
pub type Map<K, V> = std::collections::HashMap<K, V>;

/// Version string advertised as `GlideinWMSVersion` on every classad.
pub const FACTORY_VERSION: &str = concat!("glidefactory ", env!("CARGO_PKG_VERSION"));

/// Job id in the local queue: `(ClusterId, ProcId)`.
pub type JobId = (i64, i64);
