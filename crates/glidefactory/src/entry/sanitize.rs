//! Per-cycle queue maintenance, independent of any client request: purge
//! stale and unrecoverable pilots, release the held ones that still have a
//! chance.

use std::time::Duration;

use crate::config::{FactoryTuning, StaleAges};
use crate::queue::status::{JOB_STATUS_HELD, JOB_STATUS_IDLE, JOB_STATUS_RUNNING};
use crate::queue::status::{CODE_IDLE_OTHER, CODE_IDLE_STAGING, CODE_IDLE_SUBMITTED, CODE_IDLE_UNSUBMITTED};
use crate::queue::{status, CondorQ, PilotRecord};
use crate::schedd::ScheddClient;
use crate::{JobId, Map, Result};

/// Held pilots with more system holds than this are evicted through the
/// X-state instead of a plain remove.
pub const FORCE_REMOVE_HOLDS: i64 = 20;

/// Administrator policy for held pilots.
///
/// `recoverable` lists `(hold_reason_code, subcodes)` pairs that may be
/// released and retried; an empty subcode list matches every subcode. A
/// held pilot outside the table, or past `max_release_count` system holds,
/// is unrecoverable.
#[derive(Debug, Clone)]
pub struct HeldPolicy {
    recoverable: Map<i64, Vec<i64>>,
    pub max_release_count: i64,
    pub min_release_time: i64,
}

impl HeldPolicy {
    pub fn new(
        recoverable: impl IntoIterator<Item = (i64, Vec<i64>)>,
        tuning: &FactoryTuning,
    ) -> HeldPolicy {
        HeldPolicy {
            recoverable: recoverable.into_iter().collect(),
            max_release_count: tuning.max_release_count,
            min_release_time: tuning.min_release_time,
        }
    }

    /// Parse the descript form `code[:sub|sub...],code...`, e.g. `7,2:1|5`.
    pub fn parse(codes: &str, tuning: &FactoryTuning) -> HeldPolicy {
        let mut recoverable = Map::new();
        for el in codes.split(',') {
            let el = el.trim();
            if el.is_empty() {
                continue;
            }
            let (code_str, subs) = match el.split_once(':') {
                Some((code, subs)) => (code, subs),
                None => (el, ""),
            };
            let Ok(code) = code_str.trim().parse::<i64>() else {
                log::warn!("Invalid recoverable hold code '{el}'");
                continue;
            };
            let subcodes: Vec<i64> = subs
                .split('|')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            recoverable.insert(code, subcodes);
        }
        HeldPolicy {
            recoverable,
            max_release_count: tuning.max_release_count,
            min_release_time: tuning.min_release_time,
        }
    }

    fn is_recoverable_code(&self, code: Option<i64>, subcode: Option<i64>) -> bool {
        let Some(code) = code else {
            return false;
        };
        match self.recoverable.get(&code) {
            Some(subcodes) if subcodes.is_empty() => true,
            Some(subcodes) => subcode.is_some_and(|sub| subcodes.contains(&sub)),
            None => false,
        }
    }

    /// A held pilot that cannot come back: hold code outside the
    /// recoverable table, or released too many times already.
    pub fn is_unrecoverable(&self, rec: &PilotRecord) -> bool {
        if rec.job_status == JOB_STATUS_HELD && rec.num_system_holds > self.max_release_count {
            return true;
        }
        !self.is_recoverable_code(rec.hold_reason_code, rec.hold_reason_subcode)
    }

    /// Release throttle: not released too often, and held long enough for
    /// the per-retry cooldown (`num_system_holds * min_release_time`).
    pub fn is_within_held_limits(&self, rec: &PilotRecord) -> bool {
        if rec.job_status != JOB_STATUS_HELD {
            return true;
        }
        let num_holds = rec.num_system_holds.max(1);
        if num_holds > self.max_release_count {
            return false;
        }
        let held_period = rec.server_time - rec.entered_current_status;
        held_period >= num_holds * self.min_release_time
    }
}

// Extract helpers over the cycle snapshot.

pub fn extract_stale_idle(q: &CondorQ, ages: &StaleAges) -> Vec<JobId> {
    q.matching_ids(|rec| status::hash_status_stale(rec, ages) == (JOB_STATUS_IDLE, true))
}

pub fn extract_stale_running(q: &CondorQ, ages: &StaleAges) -> Vec<JobId> {
    q.matching_ids(|rec| status::hash_status_stale(rec, ages) == (JOB_STATUS_RUNNING, true))
}

pub fn extract_idle_unsubmitted(q: &CondorQ) -> Vec<JobId> {
    q.matching_ids(|rec| status::hash_status(rec) == CODE_IDLE_UNSUBMITTED)
}

pub fn extract_idle_queued(q: &CondorQ) -> Vec<JobId> {
    q.matching_ids(|rec| {
        matches!(
            status::hash_status(rec),
            CODE_IDLE_SUBMITTED | CODE_IDLE_STAGING | CODE_IDLE_OTHER
        )
    })
}

pub fn extract_running(q: &CondorQ) -> Vec<JobId> {
    q.matching_ids(|rec| rec.job_status == JOB_STATUS_RUNNING)
}

pub fn extract_held(q: &CondorQ) -> Vec<JobId> {
    q.matching_ids(|rec| rec.job_status == JOB_STATUS_HELD)
}

pub fn extract_unrecoverable_held(q: &CondorQ, policy: &HeldPolicy) -> Vec<JobId> {
    q.matching_ids(|rec| rec.job_status == JOB_STATUS_HELD && policy.is_unrecoverable(rec))
}

pub fn extract_recoverable_held(q: &CondorQ, policy: &HeldPolicy) -> Vec<JobId> {
    q.matching_ids(|rec| rec.job_status == JOB_STATUS_HELD && !policy.is_unrecoverable(rec))
}

pub fn extract_recoverable_held_within_limits(q: &CondorQ, policy: &HeldPolicy) -> Vec<JobId> {
    q.matching_ids(|rec| {
        rec.job_status == JOB_STATUS_HELD
            && !policy.is_unrecoverable(rec)
            && policy.is_within_held_limits(rec)
    })
}

fn diff_ids(base: &[JobId], subtract: &[JobId]) -> Vec<JobId> {
    base.iter()
        .filter(|id| !subtract.contains(id))
        .copied()
        .collect()
}

/// Remove the listed pilots, respecting the per-cycle cap and the
/// inter-command sleep. With `force` each removal is followed by the
/// X-state variant. Individual command failures are logged and skipped.
pub async fn remove_glideins(
    client: &dyn ScheddClient,
    schedd_name: &str,
    jids: &[JobId],
    force: bool,
    tuning: &FactoryTuning,
) -> usize {
    let mut removed: Vec<JobId> = Vec::new();
    for jid in jids {
        if removed.len() >= tuning.max_removes {
            // limit reached, stop
            break;
        }
        if !removed.is_empty() {
            tokio::time::sleep(Duration::from_secs_f64(tuning.remove_sleep)).await;
        }
        match client.remove_job(schedd_name, *jid, false).await {
            Ok(()) => {
                removed.push(*jid);
                if force {
                    log::info!("Forcing the removal of glidein {}.{} in X state", jid.0, jid.1);
                    if let Err(e) = client.remove_job(schedd_name, *jid, true).await {
                        log::warn!(
                            "Forcing the removal of glidein {}.{} failed: {e}",
                            jid.0,
                            jid.1
                        );
                    }
                }
            }
            Err(e) => {
                log::warn!("removeGlidein({schedd_name},{}.{}): {e}", jid.0, jid.1);
            }
        }
    }
    log::info!(
        "Removed {} glideins on {schedd_name}: {removed:?}",
        removed.len()
    );
    removed.len()
}

/// Release the listed held pilots, respecting the per-cycle cap and the
/// inter-command sleep.
pub async fn release_glideins(
    client: &dyn ScheddClient,
    schedd_name: &str,
    jids: &[JobId],
    tuning: &FactoryTuning,
) -> usize {
    let mut released: Vec<JobId> = Vec::new();
    for jid in jids {
        if released.len() >= tuning.max_releases {
            break;
        }
        if !released.is_empty() {
            tokio::time::sleep(Duration::from_secs_f64(tuning.release_sleep)).await;
        }
        match client.release_job(schedd_name, *jid).await {
            Ok(()) => released.push(*jid),
            Err(e) => {
                log::warn!("releaseGlidein({schedd_name},{}.{}): {e}", jid.0, jid.1);
            }
        }
    }
    log::info!(
        "Released {} glideins on {schedd_name}: {released:?}",
        released.len()
    );
    released.len()
}

/// The sanitize pass. Returns nonzero when any action was taken, so the
/// caller knows the queue was already being cleaned up.
pub async fn sanitize_glideins(
    condorq: &CondorQ,
    client: &dyn ScheddClient,
    tuning: &FactoryTuning,
    ages: &StaleAges,
    policy: &HeldPolicy,
) -> Result<i64> {
    let schedd_name = condorq.schedd_name.clone();
    let mut sanitized = 0;

    let stale_list = extract_stale_idle(condorq, ages);
    if !stale_list.is_empty() {
        sanitized = 1;
        log::warn!("Found {} stale glideins", stale_list.len());
        remove_glideins(client, &schedd_name, &stale_list, false, tuning).await;
    }

    let runstale_list = extract_stale_running(condorq, ages);
    if !runstale_list.is_empty() {
        sanitized = 1;
        log::warn!(
            "Found {} stale (>{}h) running glideins",
            runstale_list.len(),
            ages.running / 3600
        );
        remove_glideins(client, &schedd_name, &runstale_list, false, tuning).await;
    }

    let unrecoverable = extract_unrecoverable_held(condorq, policy);
    if !unrecoverable.is_empty() {
        sanitized = 1;
        // Pilots held over and over get the X-state eviction; the rest a
        // plain remove. The force set is subtracted so no pilot sees two
        // remove commands in one pass.
        let force_list: Vec<JobId> = unrecoverable
            .iter()
            .filter(|id| {
                condorq
                    .get(id)
                    .is_some_and(|rec| rec.num_system_holds > FORCE_REMOVE_HOLDS)
            })
            .copied()
            .collect();
        let plain_list = diff_ids(&unrecoverable, &force_list);
        log::warn!(
            "Found {} unrecoverable held glideins ({} force-removed)",
            unrecoverable.len(),
            force_list.len()
        );
        if !force_list.is_empty() {
            remove_glideins(client, &schedd_name, &force_list, true, tuning).await;
        }
        if !plain_list.is_empty() {
            remove_glideins(client, &schedd_name, &plain_list, false, tuning).await;
        }
    }

    let held_list = extract_recoverable_held(condorq, policy);
    if !held_list.is_empty() {
        sanitized = 1;
        let limited_held_list = extract_recoverable_held_within_limits(condorq, policy);
        log::warn!(
            "Found {} held glideins, {} within limits",
            held_list.len(),
            limited_held_list.len()
        );
        if !limited_held_list.is_empty() {
            release_glideins(client, &schedd_name, &limited_held_list, tuning).await;
        }
    }

    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedd::mock::MockSchedd;

    fn policy() -> HeldPolicy {
        HeldPolicy::parse("7", &FactoryTuning::default())
    }

    fn held(cluster: i64, proc: i64, code: i64, sub: i64, holds: i64, age: i64) -> PilotRecord {
        let mut rec = PilotRecord::stub(cluster, proc);
        rec.job_status = JOB_STATUS_HELD;
        rec.hold_reason_code = Some(code);
        rec.hold_reason_subcode = Some(sub);
        rec.num_system_holds = holds;
        rec.entered_current_status = 0;
        rec.server_time = age;
        rec
    }

    fn queue(records: Vec<PilotRecord>) -> CondorQ {
        CondorQ::from_records(
            "schedd1",
            records.into_iter().map(|r| (r.job_id(), r)).collect(),
        )
    }

    #[test]
    fn held_policy_classification() {
        let policy = policy();
        // code 7 is recoverable with any subcode
        assert!(!policy.is_unrecoverable(&held(1, 0, 7, 0, 3, 1200)));
        // code 999 is not in the table
        assert!(policy.is_unrecoverable(&held(1, 1, 999, 0, 1, 100)));
        // too many releases tips a recoverable code over
        assert!(policy.is_unrecoverable(&held(1, 2, 7, 0, 11, 100)));

        let subbed = HeldPolicy::parse("2:1|5", &FactoryTuning::default());
        assert!(!subbed.is_unrecoverable(&held(1, 3, 2, 5, 1, 0)));
        assert!(subbed.is_unrecoverable(&held(1, 4, 2, 7, 1, 0)));
    }

    #[test]
    fn release_limits_follow_the_cooldown_law() {
        let policy = policy();
        // 3 holds, held for 1200s, cooldown 3*300=900 -> releasable
        assert!(policy.is_within_held_limits(&held(100, 0, 7, 0, 3, 1200)));
        // held only 800s -> still cooling down
        assert!(!policy.is_within_held_limits(&held(100, 1, 7, 0, 3, 800)));
        // released too often
        assert!(!policy.is_within_held_limits(&held(100, 2, 7, 0, 11, 99999)));
    }

    #[tokio::test]
    async fn recoverable_held_within_limits_is_released() {
        let q = queue(vec![held(100, 0, 7, 0, 3, 1200)]);
        let mock = MockSchedd::default();
        let tuning = FactoryTuning::default();
        let sanitized =
            sanitize_glideins(&q, &mock, &tuning, &StaleAges::default(), &policy())
                .await
                .unwrap();
        assert_eq!(sanitized, 1);
        assert_eq!(mock.released_jobs(), vec![(100, 0)]);
        assert!(mock.removed_jobs().is_empty());
    }

    #[tokio::test]
    async fn unrecoverable_with_many_holds_is_force_removed_once() {
        let q = queue(vec![held(200, 1, 999, 0, 25, 100)]);
        let mock = MockSchedd::default();
        let tuning = FactoryTuning::default();
        sanitize_glideins(&q, &mock, &tuning, &StaleAges::default(), &policy())
            .await
            .unwrap();
        use crate::schedd::mock::ScheddAction;
        let actions = mock.actions.borrow();
        // one plain remove followed by the forcex variant, nothing else
        assert_eq!(
            *actions,
            vec![
                ScheddAction::Remove {
                    job: (200, 1),
                    force_x: false
                },
                ScheddAction::Remove {
                    job: (200, 1),
                    force_x: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn stale_idle_and_running_are_removed() {
        let ages = StaleAges::default();
        let mut stale_idle = PilotRecord::stub(1, 0);
        stale_idle.entered_current_status = 0;
        stale_idle.server_time = ages.idle + 10;
        let mut stale_run = PilotRecord::stub(1, 1);
        stale_run.job_status = JOB_STATUS_RUNNING;
        stale_run.entered_current_status = 0;
        stale_run.server_time = ages.running + 10;
        let mut fresh = PilotRecord::stub(1, 2);
        fresh.server_time = 100;

        let q = queue(vec![stale_idle, stale_run, fresh]);
        let mock = MockSchedd::default();
        let mut tuning = FactoryTuning::default();
        tuning.remove_sleep = 0.0;
        sanitize_glideins(&q, &mock, &tuning, &ages, &policy())
            .await
            .unwrap();
        let mut removed = mock.removed_jobs();
        removed.sort();
        assert_eq!(removed, vec![(1, 0), (1, 1)]);
    }

    #[tokio::test]
    async fn remove_cap_bounds_one_cycle() {
        let jids: Vec<JobId> = (0..10).map(|p| (5, p)).collect();
        let mock = MockSchedd::default();
        let mut tuning = FactoryTuning::default();
        tuning.max_removes = 3;
        tuning.remove_sleep = 0.0;
        let n = remove_glideins(&mock, "schedd1", &jids, false, &tuning).await;
        assert_eq!(n, 3);
        assert_eq!(mock.removed_jobs().len(), 3);
    }

    #[tokio::test]
    async fn release_cap_bounds_one_cycle() {
        let jids: Vec<JobId> = (0..30).map(|p| (6, p)).collect();
        let mock = MockSchedd::default();
        let mut tuning = FactoryTuning::default();
        tuning.max_releases = 20;
        tuning.release_sleep = 0.0;
        let n = release_glideins(&mock, "schedd1", &jids, &tuning).await;
        assert_eq!(n, 20);
    }
}
