//! Per-entry quota ledger with `(frontend, security_class)` sub-ledgers.

use std::fmt;

use crate::config::JobDescript;
use crate::queue::CondorQ;
use crate::{Map, Result};

/// Ledger key: one frontend security name plus one of its security classes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrontendKey {
    pub sec_name: String,
    pub sec_class: String,
}

impl FrontendKey {
    pub fn new(sec_name: &str, sec_class: &str) -> FrontendKey {
        FrontendKey {
            sec_name: sec_name.to_string(),
            sec_class: sec_class.to_string(),
        }
    }

    /// The form stamped on pilot jobs as `GlideinFrontendName`.
    pub fn parse(s: &str) -> Option<FrontendKey> {
        let (name, class) = s.split_once(':')?;
        Some(FrontendKey::new(name, class))
    }
}

impl fmt::Display for FrontendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sec_name, self.sec_class)
    }
}

/// Counters and ceilings for one `(frontend, security_class)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubLedger {
    pub idle: i64,
    pub running: i64,
    pub held: i64,
    pub max_glideins: i64,
    pub max_idle: i64,
    pub max_held: i64,
}

impl SubLedger {
    fn with_limits(max_glideins: i64, max_idle: i64, max_held: i64) -> SubLedger {
        SubLedger {
            idle: 0,
            running: 0,
            held: 0,
            max_glideins,
            max_idle,
            max_held,
        }
    }
}

/// Entry-level totals plus the sub-ledgers; rebuilt from the queue snapshot
/// every cycle, never carried across cycles.
#[derive(Debug, Clone)]
pub struct GlideinTotals {
    pub entry_name: String,
    pub entry_idle: i64,
    pub entry_running: i64,
    pub entry_held: i64,
    pub entry_max_glideins: i64,
    pub entry_max_idle: i64,
    pub entry_max_held: i64,
    default_max_glideins: i64,
    default_max_idle: i64,
    default_max_held: i64,
    frontend_limits: Map<FrontendKey, SubLedger>,
}

/// Parse one `frontend:sec_class;number,...` override string into the
/// ledger map, creating missing sub-ledgers with the defaults.
fn apply_overrides(
    totals: &mut GlideinTotals,
    overrides: &str,
    num_factories: u32,
    set: impl Fn(&mut SubLedger, i64),
) {
    if !overrides.contains(';') {
        return;
    }
    for el in overrides.split(',') {
        let Some((key_str, number)) = el.split_once(';') else {
            log::warn!("Invalid FrontendName:SecurityClassName;number combo '{el}'");
            continue;
        };
        let (Some(key), Ok(number)) = (FrontendKey::parse(key_str.trim()), number.trim().parse::<i64>())
        else {
            log::warn!("Invalid FrontendName:SecurityClassName;number combo '{el}'");
            continue;
        };
        let ledger = totals.ledger_mut(&key);
        set(ledger, divide_limit(number, num_factories));
    }
}

/// Per-frontend ceilings are shared across the factory instances serving
/// the entry.
fn divide_limit(value: i64, num_factories: u32) -> i64 {
    // Equivalent to the still-unstable `i64::div_ceil` for signed integers.
    let rhs = num_factories as i64;
    let d = value / rhs;
    let r = value % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

impl GlideinTotals {
    pub fn new(
        job_descript: &JobDescript,
        all_frontend_pairs: &[(String, String)],
        entry_condorq: &CondorQ,
        num_factories: u32,
    ) -> Result<GlideinTotals> {
        let mut totals = GlideinTotals {
            entry_name: job_descript.entry_name.clone(),
            entry_idle: 0,
            entry_running: 0,
            entry_held: 0,
            entry_max_glideins: job_descript.per_entry_max_glideins,
            entry_max_idle: job_descript.per_entry_max_idle,
            entry_max_held: job_descript.per_entry_max_held,
            default_max_glideins: divide_limit(job_descript.default_fesc_max_glideins, num_factories),
            default_max_idle: divide_limit(job_descript.default_fesc_max_idle, num_factories),
            default_max_held: divide_limit(job_descript.default_fesc_max_held, num_factories),
            frontend_limits: Map::new(),
        };

        let counts = entry_condorq.status_counts();
        totals.entry_idle = counts.idle();
        totals.entry_running = counts.running();
        totals.entry_held = counts.held();

        for (sec_name, sec_class) in all_frontend_pairs {
            let key = FrontendKey::new(sec_name, sec_class);
            totals.ledger_mut(&key);
        }

        apply_overrides(
            &mut totals,
            &job_descript.per_frontend_max_glideins,
            num_factories,
            |l, v| l.max_glideins = v,
        );
        apply_overrides(
            &mut totals,
            &job_descript.per_frontend_max_idle,
            num_factories,
            |l, v| l.max_idle = v,
        );
        apply_overrides(
            &mut totals,
            &job_descript.per_frontend_max_held,
            num_factories,
            |l, v| l.max_held = v,
        );

        // Count the queue per frontend key; the filtered views share the
        // cycle snapshot.
        let keys: Vec<FrontendKey> = totals.frontend_limits.keys().cloned().collect();
        for key in keys {
            let tag = key.to_string();
            let fe_q = entry_condorq.sub_query(|rec| rec.frontend_name.as_deref() == Some(&tag));
            let counts = fe_q.status_counts();
            let ledger = totals.ledger_mut(&key);
            ledger.idle = counts.idle();
            ledger.running = counts.running();
            ledger.held = counts.held();
        }

        Ok(totals)
    }

    fn ledger_mut(&mut self, key: &FrontendKey) -> &mut SubLedger {
        let defaults = SubLedger::with_limits(
            self.default_max_glideins,
            self.default_max_idle,
            self.default_max_held,
        );
        self.frontend_limits
            .entry(key.clone())
            .or_insert(defaults)
    }

    pub fn sub_ledger(&self, key: &FrontendKey) -> Option<&SubLedger> {
        self.frontend_limits.get(key)
    }

    pub fn frontend_keys(&self) -> impl Iterator<Item = &FrontendKey> {
        self.frontend_limits.keys()
    }

    /// How many more idle pilots may be added for this frontend pair.
    /// Clamps against the entry and sub-ledger ceilings; does not look at
    /// the request's own maximum and does not update any counter.
    pub fn can_add_idle_glideins(&mut self, nr_glideins: i64, key: &FrontendKey) -> i64 {
        let mut allowed = nr_glideins;

        if self.entry_idle + allowed > self.entry_max_idle {
            allowed = self.entry_max_idle - self.entry_idle;
        }
        if self.entry_idle + allowed + self.entry_running + self.entry_held > self.entry_max_glideins
        {
            allowed = self.entry_max_glideins - self.entry_idle - self.entry_running;
        }

        let fe = self.ledger_mut(key);
        if fe.idle + allowed > fe.max_idle {
            allowed = fe.max_idle - fe.idle;
        }
        if fe.idle + fe.held + allowed + fe.running > fe.max_glideins {
            allowed = fe.max_glideins - fe.idle - fe.held - fe.running;
        }

        allowed
    }

    /// Record a successful submission in both ledgers so later requests in
    /// the same cycle see the reduced headroom.
    pub fn add_idle_glideins(&mut self, nr_glideins: i64, key: &FrontendKey) {
        self.entry_idle += nr_glideins;
        self.ledger_mut(key).idle += nr_glideins;
    }

    pub fn has_sec_class_exceeded_max_held(&mut self, key: &FrontendKey) -> bool {
        let fe = self.ledger_mut(key);
        fe.held >= fe.max_held
    }

    pub fn has_entry_exceeded_max_held(&self) -> bool {
        self.entry_held >= self.entry_max_held
    }

    pub fn has_entry_exceeded_max_idle(&self) -> bool {
        self.entry_idle >= self.entry_max_idle
    }

    pub fn has_entry_exceeded_max_glideins(&self) -> bool {
        self.entry_idle + self.entry_running + self.entry_held >= self.entry_max_glideins
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::GridType;
    use crate::queue::PilotRecord;

    pub fn test_job_descript() -> JobDescript {
        JobDescript {
            entry_name: "osg_test".to_string(),
            schedd: "schedd1".to_string(),
            grid_type: GridType::Condor,
            gatekeeper: "gk.example.net/jobmanager".to_string(),
            auth_method: "grid_proxy".to_string(),
            trust_domain: "OSG".to_string(),
            verbosity: "std".to_string(),
            startup_dir: "OSG".to_string(),
            slots_layout: "fixed".to_string(),
            rsl: None,
            proxy_url: None,
            per_entry_max_glideins: 100,
            per_entry_max_idle: 50,
            per_entry_max_held: 20,
            default_fesc_max_glideins: 40,
            default_fesc_max_idle: 10,
            default_fesc_max_held: 5,
            per_frontend_max_glideins: String::new(),
            per_frontend_max_idle: String::new(),
            per_frontend_max_held: String::new(),
            recoverable_hold_codes: "7".to_string(),
            selection_algorithm: "Default".to_string(),
        }
    }

    fn queue_with(statuses: &[(i64, &str)]) -> CondorQ {
        let mut records = Map::new();
        for (proc, (job_status, fe)) in statuses.iter().enumerate() {
            let mut rec = PilotRecord::stub(1, proc as i64);
            rec.job_status = *job_status;
            rec.frontend_name = Some(fe.to_string());
            records.insert(rec.job_id(), rec);
        }
        CondorQ::from_records("schedd1", records)
    }

    fn pairs() -> Vec<(String, String)> {
        vec![
            ("feA".to_string(), "sec1".to_string()),
            ("feB".to_string(), "sec1".to_string()),
        ]
    }

    #[test]
    fn sub_ledgers_sum_to_entry_totals() {
        let q = queue_with(&[
            (1, "feA:sec1"),
            (1, "feA:sec1"),
            (2, "feA:sec1"),
            (1, "feB:sec1"),
            (5, "feB:sec1"),
        ]);
        let totals = GlideinTotals::new(&test_job_descript(), &pairs(), &q, 1).unwrap();
        assert_eq!(totals.entry_idle, 3);
        assert_eq!(totals.entry_running, 1);
        assert_eq!(totals.entry_held, 1);

        let a = totals.sub_ledger(&FrontendKey::new("feA", "sec1")).unwrap();
        let b = totals.sub_ledger(&FrontendKey::new("feB", "sec1")).unwrap();
        assert_eq!(a.idle + b.idle, totals.entry_idle);
        assert_eq!(a.running + b.running, totals.entry_running);
        assert_eq!(a.held + b.held, totals.entry_held);
    }

    #[test]
    fn can_add_idle_clamps_on_every_ceiling() {
        let q = queue_with(&[(1, "feA:sec1"), (2, "feA:sec1")]);
        let mut totals = GlideinTotals::new(&test_job_descript(), &pairs(), &q, 1).unwrap();
        let key = FrontendKey::new("feA", "sec1");

        // sub-ledger max_idle=10 with 1 idle -> at most 9
        assert_eq!(totals.can_add_idle_glideins(100, &key), 9);
        assert_eq!(totals.can_add_idle_glideins(5, &key), 5);

        // exhaust the sub-ledger idle ceiling
        totals.add_idle_glideins(9, &key);
        assert!(totals.can_add_idle_glideins(1, &key) <= 0);
    }

    #[test]
    fn entry_ceiling_applies_across_frontends() {
        let mut jd = test_job_descript();
        jd.per_entry_max_idle = 12;
        jd.default_fesc_max_idle = 10;
        let q = queue_with(&[]);
        let mut totals = GlideinTotals::new(&jd, &pairs(), &q, 1).unwrap();

        let a = FrontendKey::new("feA", "sec1");
        let b = FrontendKey::new("feB", "sec1");
        assert_eq!(totals.can_add_idle_glideins(10, &a), 10);
        totals.add_idle_glideins(10, &a);
        // only 2 slots left at the entry level even though feB's own limit
        // would allow 10
        assert_eq!(totals.can_add_idle_glideins(10, &b), 2);
    }

    #[test]
    fn per_frontend_overrides_and_factory_division() {
        let mut jd = test_job_descript();
        jd.per_frontend_max_idle = "feA:sec1;6".to_string();
        let q = queue_with(&[]);
        // two factory instances share the entry
        let mut totals = GlideinTotals::new(&jd, &pairs(), &q, 2).unwrap();

        let a = FrontendKey::new("feA", "sec1");
        let b = FrontendKey::new("feB", "sec1");
        // override 6 / 2 = 3
        assert_eq!(totals.can_add_idle_glideins(100, &a), 3);
        // default 10 / 2 = 5
        assert_eq!(totals.can_add_idle_glideins(100, &b), 5);
    }

    #[test]
    fn held_ceiling_predicate() {
        let q = queue_with(&[
            (5, "feA:sec1"),
            (5, "feA:sec1"),
            (5, "feA:sec1"),
            (5, "feA:sec1"),
            (5, "feA:sec1"),
        ]);
        let mut totals = GlideinTotals::new(&test_job_descript(), &pairs(), &q, 1).unwrap();
        // default max_held = 5, held = 5
        assert!(totals.has_sec_class_exceeded_max_held(&FrontendKey::new("feA", "sec1")));
        assert!(!totals.has_sec_class_exceeded_max_held(&FrontendKey::new("feB", "sec1")));
    }

    #[test]
    fn unknown_frontend_pair_gets_default_ledger() {
        let q = queue_with(&[]);
        let mut totals = GlideinTotals::new(&test_job_descript(), &pairs(), &q, 1).unwrap();
        let stranger = FrontendKey::new("feC", "sec9");
        assert_eq!(totals.can_add_idle_glideins(3, &stranger), 3);
    }
}
