//! The per-request decision function: how many pilots to submit, or which
//! excess pilots to drop.

use std::future::Future;
use std::pin::Pin;

use crate::config::{FactoryTuning, StaleAges};
use crate::creds::SubmitCredentials;
use crate::entry::sanitize::{
    self, extract_idle_queued, extract_idle_unsubmitted, extract_recoverable_held,
    extract_running, extract_unrecoverable_held, HeldPolicy,
};
use crate::entry::totals::{FrontendKey, GlideinTotals};
use crate::queue::CondorQ;
use crate::schedd::ScheddClient;
use crate::{JobId, Result};

/// Excess-removal directive from the frontend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveExcessMode {
    No,
    Wait,
    Idle,
    All,
}

impl RemoveExcessMode {
    pub fn parse(value: &str) -> RemoveExcessMode {
        match value {
            "NO" => RemoveExcessMode::No,
            "WAIT" => RemoveExcessMode::Wait,
            "IDLE" => RemoveExcessMode::Idle,
            "ALL" => RemoveExcessMode::All,
            other => {
                log::info!("Unknown RemoveExcess provided in the request '{other}', assuming 'NO'");
                RemoveExcessMode::No
            }
        }
    }

    fn removes_wait(&self) -> bool {
        !matches!(self, RemoveExcessMode::No)
    }

    fn removes_idle(&self) -> bool {
        matches!(self, RemoveExcessMode::Idle | RemoveExcessMode::All)
    }

    fn removes_running(&self) -> bool {
        matches!(self, RemoveExcessMode::All)
    }
}

/// `(mode, margin, frontend_min_idle)` triple. `frontend_min_idle` is the
/// frontend's own idea of the idle floor; it differs from the reconciler's
/// effective `min_idle` when the entry is in downtime.
#[derive(Debug, Clone, Copy)]
pub struct RemoveExcess {
    pub mode: RemoveExcessMode,
    pub margin: i64,
    pub frontend_min_idle: i64,
}

/// Submission hook handed to the reconciler; the real implementation drives
/// the gateway submit tool, tests plug in a recorder.
pub trait PilotSubmitter {
    fn submit<'a>(
        &'a self,
        nr_glideins: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobId>>> + 'a>>;
}

/// Everything a reconciliation pass needs besides the request itself.
pub struct ReconcileCtx<'a> {
    pub schedd: &'a dyn ScheddClient,
    pub tuning: &'a FactoryTuning,
    pub stale_ages: &'a StaleAges,
    pub held_policy: &'a HeldPolicy,
}

/// Look at the queue and decide how many pilots to submit for one request;
/// returns the number of newly submitted pilots.
///
/// When a limit is hit and the frontend asked for excess removal, the
/// cleanup path runs instead. When the held ceiling for the sub-ledger is
/// hit, reconciliation is abandoned for a sanitize pass.
#[allow(clippy::too_many_arguments)]
pub async fn keep_idle_glideins(
    client_condorq: &CondorQ,
    client_int_name: &str,
    req_min_idle: i64,
    req_max_glideins: i64,
    remove_excess: RemoveExcess,
    submit_credentials: &SubmitCredentials,
    glidein_totals: &mut GlideinTotals,
    frontend_key: &FrontendKey,
    submitter: &dyn PilotSubmitter,
    ctx: &ReconcileCtx<'_>,
) -> Result<i64> {
    // Only this credential's pilots count against the request.
    let cred_id = submit_credentials.id.clone();
    let condorq = client_condorq.sub_query(|rec| rec.credential_id.as_deref() == Some(&cred_id));

    if glidein_totals.has_sec_class_exceeded_max_held(frontend_key) {
        let ledger = glidein_totals
            .sub_ledger(frontend_key)
            .expect("ledger exists after the exceeded check");
        log::info!(
            "Too many held glideins for this frontend-security class: {}=held {}=max_held",
            ledger.held,
            ledger.max_held
        );
        // run sanitize, we have to get out of this mess
        return sanitize::sanitize_glideins(
            client_condorq,
            ctx.schedd,
            ctx.tuning,
            ctx.stale_ages,
            ctx.held_policy,
        )
        .await;
    }

    let qc_status = condorq.status_counts();
    let q_idle_glideins = qc_status.idle();
    let q_held_glideins = qc_status.held();
    let q_running_glideins = qc_status.running();

    let mut add_glideins = req_min_idle - q_idle_glideins;

    if add_glideins <= 0 {
        log::info!(
            "Have enough glideins: idle={q_idle_glideins} req_idle={req_min_idle}, not submitting"
        );
        return clean_glidein_queue(
            remove_excess,
            glidein_totals,
            &condorq,
            req_max_glideins,
            frontend_key,
            ctx,
        )
        .await;
    }

    // Would adding more idle exceed the request's own maximum?
    if q_idle_glideins + q_held_glideins + q_running_glideins + add_glideins >= req_max_glideins {
        add_glideins = req_max_glideins - q_idle_glideins - q_held_glideins - q_running_glideins;
        if add_glideins <= 0 {
            log::info!(
                "Additional idle glideins would exceed request max_glideins {req_max_glideins}, \
                 not submitting"
            );
            return clean_glidein_queue(
                remove_excess,
                glidein_totals,
                &condorq,
                req_max_glideins,
                frontend_key,
                ctx,
            )
            .await;
        }
    }

    add_glideins = glidein_totals.can_add_idle_glideins(add_glideins, frontend_key);
    if add_glideins <= 0 {
        log::info!(
            "Additional {req_min_idle} idle glideins requested by {frontend_key} exceeds \
             frontend:security class limit for the entry, not submitting"
        );
        return clean_glidein_queue(
            remove_excess,
            glidein_totals,
            &condorq,
            req_max_glideins,
            frontend_key,
            ctx,
        )
        .await;
    }

    // Per-cycle submission rate; keeps one frontend from taking every slot.
    if add_glideins > ctx.tuning.max_submits {
        add_glideins = ctx.tuning.max_submits;
        log::debug!(
            "Additional idle glideins exceeded entry max submit rate, adjusted to {add_glideins}"
        );
    }

    log::debug!("Submitting {add_glideins} glideins for {client_int_name}");
    match submitter.submit(add_glideins).await {
        Ok(submitted) => {
            let count = submitted.len() as i64;
            glidein_totals.add_idle_glideins(count, frontend_key);
            Ok(count)
        }
        Err(e) => {
            // Partial successes still entered the queue and count against
            // the ledgers; the failure ends only this request.
            let submitted = e.submitted_jobs().len() as i64;
            if submitted > 0 {
                glidein_totals.add_idle_glideins(submitted, frontend_key);
            }
            log::warn!("{e}");
            Ok(submitted)
        }
    }
}

/// Remove excess pilots per the frontend directive. One removal category per
/// cycle: unsubmitted-idle first, then submitted-idle, then running (which
/// also drops every held pilot).
///
/// The ledgers are deliberately not adjusted here; removals take a cycle or
/// more to land and the next snapshot will reflect them.
pub async fn clean_glidein_queue(
    remove_excess: RemoveExcess,
    glidein_totals: &GlideinTotals,
    condorq: &CondorQ,
    req_max_glideins: i64,
    frontend_key: &FrontendKey,
    ctx: &ReconcileCtx<'_>,
) -> Result<i64> {
    let Some(ledger) = glidein_totals.sub_ledger(frontend_key) else {
        return Ok(0);
    };
    let sec_class_idle = ledger.idle;
    let sec_class_held = ledger.held;
    let sec_class_running = ledger.running;

    let mode = remove_excess.mode;
    let margin = remove_excess.margin;
    let fe_min_idle = remove_excess.frontend_min_idle;
    let schedd_name = condorq.schedd_name.clone();

    let over_idle =
        (mode.removes_wait() || mode.removes_idle()) && sec_class_idle > fe_min_idle + margin;
    let over_running = mode.removes_running()
        && (sec_class_running + sec_class_idle) > req_max_glideins + margin;

    if over_idle || over_running {
        let mut remove_nr = sec_class_idle - fe_min_idle - margin;
        if over_running {
            // past max_run the idle floor does not make sense to start with
            let remove_all_nr = (sec_class_running + sec_class_idle) - req_max_glideins - margin;
            if remove_all_nr > remove_nr {
                remove_nr = remove_all_nr;
            }
        }
        let remove_nr = remove_nr.max(0) as usize;

        if mode.removes_wait() {
            let mut idle_list = extract_idle_unsubmitted(condorq);
            if !idle_list.is_empty() {
                idle_list.truncate(remove_nr);
                log::info!(
                    "Too many glideins: min_idle={fe_min_idle}, idle={sec_class_idle}, \
                     unsubmitted={}",
                    idle_list.len()
                );
                log::info!("Removing {} unsubmitted idle glideins", idle_list.len());
                if !idle_list.is_empty() {
                    sanitize::remove_glideins(ctx.schedd, &schedd_name, &idle_list, false, ctx.tuning)
                        .await;
                    // others will be retried in the next cycle, if needed
                    return Ok(1);
                }
            }
        }

        if mode.removes_idle() {
            let mut idle_list = extract_idle_queued(condorq);
            if !idle_list.is_empty() {
                idle_list.truncate(remove_nr);
                log::info!(
                    "Too many glideins: min_idle={fe_min_idle}, idle={sec_class_idle}"
                );
                log::info!("Removing {} idle glideins", idle_list.len());
                sanitize::remove_glideins(ctx.schedd, &schedd_name, &idle_list, false, ctx.tuning)
                    .await;
                return Ok(1);
            }
        }

        if mode.removes_running() {
            log::info!(
                "Too many glideins: idle={sec_class_idle}, running={sec_class_running}, \
                 max_running={req_max_glideins}"
            );
            let mut rm_list = extract_running(condorq);
            rm_list.truncate(remove_nr);
            log::info!("Removing {} running glideins", rm_list.len());

            // No reason to keep held pilots alive if we are about to kill
            // running ones anyhow.
            let unrecoverable_held_list = extract_unrecoverable_held(condorq, ctx.held_policy);
            if !unrecoverable_held_list.is_empty() {
                log::info!(
                    "Removing {} unrecoverable held glideins",
                    unrecoverable_held_list.len()
                );
                rm_list.extend(unrecoverable_held_list);
            }
            let held_list = extract_recoverable_held(condorq, ctx.held_policy);
            if !held_list.is_empty() {
                log::info!("Removing {} held glideins", held_list.len());
                rm_list.extend(held_list);
            }

            if !rm_list.is_empty() {
                sanitize::remove_glideins(ctx.schedd, &schedd_name, &rm_list, false, ctx.tuning)
                    .await;
                return Ok(1);
            }
        }
    } else if req_max_glideins == 0 && sec_class_held > 0 {
        // No glideins desired: purge every held pilot, whatever the mode.
        // Idle and running are handled by the paths above.
        let mut rm_list = extract_unrecoverable_held(condorq, ctx.held_policy);
        if !rm_list.is_empty() {
            log::info!("Removing {} unrecoverable held glideins", rm_list.len());
        }
        let held_list = extract_recoverable_held(condorq, ctx.held_policy);
        if !held_list.is_empty() {
            log::info!("Removing {} held glideins", held_list.len());
        }
        rm_list.extend(held_list);
        if !rm_list.is_empty() {
            sanitize::remove_glideins(ctx.schedd, &schedd_name, &rm_list, false, ctx.tuning).await;
            return Ok(1);
        }
    }

    Ok(0)
}
