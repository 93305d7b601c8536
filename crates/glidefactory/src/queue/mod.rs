//! Snapshot of the local batch queue: the pilots this factory has submitted.

pub mod status;

use crate::classad::ClassAd;
use crate::schedd::ScheddClient;
use crate::{JobId, Map, Result};

use status::StatusCounts;

// Attributes stamped on every pilot job by the submit file.
pub const ATTR_FACTORY: &str = "GlideinFactory";
pub const ATTR_GLIDEIN: &str = "GlideinName";
pub const ATTR_ENTRY: &str = "GlideinEntryName";
pub const ATTR_CLIENT: &str = "GlideinClient";
pub const ATTR_FRONTEND: &str = "GlideinFrontendName";
pub const ATTR_CREDENTIAL_ID: &str = "GlideinCredentialIdentifier";
pub const ATTR_SECURITY_CLASS: &str = "GlideinSecurityClass";
pub const ATTR_SUBMIT_FILE: &str = "GlideinEntrySubmitFile";

/// The fixed attribute list fetched for every pilot.
pub const QUEUE_ATTRS: &[&str] = &[
    "ClusterId",
    "ProcId",
    "JobStatus",
    "GridJobStatus",
    "ServerTime",
    "EnteredCurrentStatus",
    ATTR_SUBMIT_FILE,
    ATTR_CREDENTIAL_ID,
    "HoldReasonCode",
    "HoldReasonSubCode",
    "HoldReason",
    "NumSystemHolds",
    ATTR_FRONTEND,
    ATTR_CLIENT,
    ATTR_SECURITY_CLASS,
];

/// One pilot job in the local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PilotRecord {
    pub cluster: i64,
    pub proc: i64,
    pub job_status: i64,
    pub grid_job_status: Option<String>,
    pub server_time: i64,
    pub entered_current_status: i64,
    pub submit_file: Option<String>,
    pub credential_id: Option<String>,
    pub hold_reason_code: Option<i64>,
    pub hold_reason_subcode: Option<i64>,
    pub hold_reason: Option<String>,
    pub num_system_holds: i64,
    pub frontend_name: Option<String>,
    pub client_name: Option<String>,
    pub security_class: Option<String>,
}

impl PilotRecord {
    pub fn job_id(&self) -> JobId {
        (self.cluster, self.proc)
    }

    pub fn from_classad(ad: &ClassAd) -> Option<PilotRecord> {
        let cluster = ad.get_ci("ClusterId")?.as_int()?;
        let proc = ad.get_ci("ProcId")?.as_int()?;
        Some(PilotRecord {
            cluster,
            proc,
            job_status: ad.get_int("JobStatus").unwrap_or(0),
            grid_job_status: ad.get_str("GridJobStatus").map(|s| s.to_string()),
            server_time: ad.get_int("ServerTime").unwrap_or(0),
            entered_current_status: ad.get_int("EnteredCurrentStatus").unwrap_or(0),
            submit_file: ad.get_str(ATTR_SUBMIT_FILE).map(|s| s.to_string()),
            credential_id: ad.get_str(ATTR_CREDENTIAL_ID).map(|s| s.to_string()),
            hold_reason_code: ad.get_int("HoldReasonCode"),
            hold_reason_subcode: ad.get_int("HoldReasonSubCode"),
            hold_reason: ad.get_str("HoldReason").map(|s| s.to_string()),
            num_system_holds: ad.get_int("NumSystemHolds").unwrap_or(0),
            frontend_name: ad.get_str(ATTR_FRONTEND).map(|s| s.to_string()),
            client_name: ad.get_str(ATTR_CLIENT).map(|s| s.to_string()),
            security_class: ad.get_str(ATTR_SECURITY_CLASS).map(|s| s.to_string()),
        })
    }

    #[cfg(test)]
    pub fn stub(cluster: i64, proc: i64) -> PilotRecord {
        PilotRecord {
            cluster,
            proc,
            job_status: 1,
            grid_job_status: None,
            server_time: 1000,
            entered_current_status: 0,
            submit_file: None,
            credential_id: None,
            hold_reason_code: None,
            hold_reason_subcode: None,
            hold_reason: None,
            num_system_holds: 0,
            frontend_name: None,
            client_name: None,
            security_class: None,
        }
    }
}

/// Constraint matching this factory's pilots for one entry, optionally
/// narrowed to a single client.
pub fn glidein_constraint(
    factory_name: &str,
    glidein_name: &str,
    entry_name: &str,
    client_name: Option<&str>,
) -> String {
    let client_constraint = match client_name {
        Some(client) => format!(" && ({ATTR_CLIENT} =?= \"{client}\")"),
        None => String::new(),
    };
    format!(
        "({ATTR_FACTORY} =?= \"{factory_name}\") && ({ATTR_GLIDEIN} =?= \"{glidein_name}\") && \
         ({ATTR_ENTRY} =?= \"{entry_name}\"){client_constraint} && ({ATTR_CREDENTIAL_ID} =!= UNDEFINED)"
    )
}

/// Cached queue snapshot keyed by `(cluster, proc)`.
///
/// The snapshot is taken once per entry-cycle and shared by every
/// request-processing pass of that cycle; derived views never re-query.
#[derive(Debug, Clone, Default)]
pub struct CondorQ {
    pub schedd_name: String,
    records: Map<JobId, PilotRecord>,
}

impl CondorQ {
    pub fn from_records(schedd_name: &str, records: Map<JobId, PilotRecord>) -> CondorQ {
        CondorQ {
            schedd_name: schedd_name.to_string(),
            records,
        }
    }

    /// Fetch the pilots of this factory/entry from the local schedd.
    pub async fn load(
        client: &dyn ScheddClient,
        schedd_name: &str,
        factory_name: &str,
        glidein_name: &str,
        entry_name: &str,
        client_name: Option<&str>,
    ) -> Result<CondorQ> {
        let constraint = glidein_constraint(factory_name, glidein_name, entry_name, client_name);
        let ads = client
            .query_queue(schedd_name, &constraint, QUEUE_ATTRS)
            .await?;
        let mut records = Map::new();
        for ad in &ads {
            if let Some(record) = PilotRecord::from_classad(ad) {
                records.insert(record.job_id(), record);
            }
        }
        Ok(CondorQ::from_records(schedd_name, records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &PilotRecord> {
        self.records.values()
    }

    pub fn get(&self, job_id: &JobId) -> Option<&PilotRecord> {
        self.records.get(job_id)
    }

    /// A filtered view over the cached records; no re-query happens.
    pub fn sub_query(&self, pred: impl Fn(&PilotRecord) -> bool) -> CondorQ {
        let records = self
            .records
            .iter()
            .filter(|(_, rec)| pred(rec))
            .map(|(id, rec)| (*id, rec.clone()))
            .collect();
        CondorQ::from_records(&self.schedd_name, records)
    }

    /// Group the cached records into a map-of-maps by a key function.
    pub fn nested_group(
        &self,
        key_fn: impl Fn(&PilotRecord) -> String,
    ) -> Map<String, Map<JobId, PilotRecord>> {
        let mut out: Map<String, Map<JobId, PilotRecord>> = Map::new();
        for (id, rec) in &self.records {
            out.entry(key_fn(rec)).or_default().insert(*id, rec.clone());
        }
        out
    }

    /// Count records per hash value; records hashing to `None` are skipped.
    pub fn count_by(&self, hash_fn: impl Fn(&PilotRecord) -> Option<i64>) -> StatusCounts {
        let mut counts: Map<i64, i64> = Map::new();
        for rec in self.records.values() {
            if let Some(h) = hash_fn(rec) {
                *counts.entry(h).or_insert(0) += 1;
            }
        }
        StatusCounts::from_counts(counts)
    }

    /// Collect job ids per hash value, each list sorted for determinism.
    pub fn list_by(&self, hash_fn: impl Fn(&PilotRecord) -> Option<i64>) -> Map<i64, Vec<JobId>> {
        let mut out: Map<i64, Vec<JobId>> = Map::new();
        for (id, rec) in &self.records {
            if let Some(h) = hash_fn(rec) {
                out.entry(h).or_default().push(*id);
            }
        }
        for ids in out.values_mut() {
            ids.sort();
        }
        out
    }

    /// Job ids matching a predicate, sorted.
    pub fn matching_ids(&self, pred: impl Fn(&PilotRecord) -> bool) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .records
            .iter()
            .filter(|(_, rec)| pred(rec))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Folded status counts of the snapshot.
    pub fn status_counts(&self) -> StatusCounts {
        self.count_by(|rec| Some(status::hash_status(rec)))
    }
}
