//! Defect ledger: the Active/Resolved lifecycle of every defect ever seen.
//!
//! Entries are keyed by `(matching key, rule id)` and never deleted. Each reconciliation of a
//! matching key applies exactly one of these transitions per entry:
//!
//! | before    | finding this run | rule evaluated | after     | transition  |
//! |-----------|------------------|----------------|-----------|-------------|
//! | absent    | yes              |                | Active    | `Opened`    |
//! | Active    | yes              |                | Active    | `Persisted` |
//! | Resolved  | yes              |                | Active    | `Regressed` |
//! | Active    | no               | yes            | Resolved  | `Resolved`  |
//! | Resolved  | no               | yes            | Resolved  | none        |
//! | any       | no               | no (disabled)  | unchanged | none        |
//!
//! `first_seen_run` is written once, when the entry is opened.

use crate::sentinel::rules::{Finding, Severity};
use fhir::MatchingKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Monotonic run counter.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RunId(u64);

impl RunId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectStatus {
    Active,
    Resolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defect {
    pub rule_id: String,
    pub severity: Severity,
    pub matching_key: MatchingKey,
    pub first_seen_run: RunId,
    pub last_seen_run: RunId,
    pub status: DefectStatus,
    /// Latest finding text, kept for reporting.
    #[serde(default)]
    pub detail: String,
}

impl Defect {
    pub fn is_active(&self) -> bool {
        self.status == DefectStatus::Active
    }

    pub fn is_blocking(&self) -> bool {
        self.is_active() && self.severity == Severity::Clinical
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    /// ∅ → Active
    Opened,
    /// Active → Active
    Persisted,
    /// Resolved → Active
    Regressed,
    /// Active → Resolved
    Resolved,
}

/// One lifecycle change applied during reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub matching_key: MatchingKey,
    pub rule_id: String,
    pub severity: Severity,
    pub run: RunId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("run {run} is older than run {last_seen} already recorded for {matching_key}")]
    StaleRun {
        matching_key: MatchingKey,
        run: RunId,
        last_seen: RunId,
    },
    #[error("defect ledger schema error: {0}")]
    Schema(String),
}

/// All defects, grouped by matching key then rule id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectLedger {
    #[serde(default)]
    last_run: RunId,
    #[serde(default)]
    entries: BTreeMap<MatchingKey, BTreeMap<String, Defect>>,
}

impl DefectLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest run id this ledger has seen.
    pub fn last_run(&self) -> RunId {
        self.last_run
    }

    /// The id the next run should use.
    pub fn next_run(&self) -> RunId {
        self.last_run.next()
    }

    /// Claim [`Self::next_run`] for a new run.
    pub fn begin_run(&mut self) -> RunId {
        self.last_run = self.next_run();
        self.last_run
    }

    pub fn get(&self, key: &MatchingKey, rule_id: &str) -> Option<&Defect> {
        self.entries.get(key)?.get(rule_id)
    }

    /// Defects recorded against one matching key, ordered by rule id.
    pub fn defects_for<'a>(&'a self, key: &MatchingKey) -> impl Iterator<Item = &'a Defect> + 'a {
        self.entries.get(key).into_iter().flat_map(|rules| rules.values())
    }

    /// Every defect, ordered by matching key then rule id.
    pub fn iter(&self) -> impl Iterator<Item = &Defect> {
        self.entries.values().flat_map(|rules| rules.values())
    }

    pub fn active(&self) -> impl Iterator<Item = &Defect> {
        self.iter().filter(|d| d.is_active())
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the key has at least one Active clinical defect.
    pub fn has_blocking(&self, key: &MatchingKey) -> bool {
        self.defects_for(key).any(Defect::is_blocking)
    }

    /// Fails if `run` is older than any run already recorded for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StaleRun`].
    pub fn check_run(&self, key: &MatchingKey, run: RunId) -> Result<(), LedgerError> {
        match self.defects_for(key).map(|d| d.last_seen_run).max() {
            Some(last_seen) if run < last_seen => Err(LedgerError::StaleRun {
                matching_key: key.clone(),
                run,
                last_seen,
            }),
            _ => Ok(()),
        }
    }

    /// Reconcile this run's findings for one matching key.
    ///
    /// `evaluated` holds the rule ids that ran; entries for any other rule are left untouched.
    /// The key is either fully reconciled or, on error, not touched at all.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StaleRun`] if `run` is older than the key's last seen run.
    pub fn reconcile(
        &mut self,
        key: &MatchingKey,
        findings: &[Finding],
        evaluated: &BTreeSet<String>,
        run: RunId,
    ) -> Result<Vec<Transition>, LedgerError> {
        self.check_run(key, run)?;
        self.last_run = self.last_run.max(run);

        let found: BTreeMap<&str, &Finding> =
            findings.iter().map(|f| (f.rule_id.as_str(), f)).collect();
        let rules = self.entries.entry(key.clone()).or_default();
        let mut transitions = Vec::new();

        for (rule_id, finding) in &found {
            let kind = match rules.get_mut(*rule_id) {
                None => {
                    rules.insert(
                        rule_id.to_string(),
                        Defect {
                            rule_id: rule_id.to_string(),
                            severity: finding.severity,
                            matching_key: key.clone(),
                            first_seen_run: run,
                            last_seen_run: run,
                            status: DefectStatus::Active,
                            detail: finding.detail.clone(),
                        },
                    );
                    TransitionKind::Opened
                }
                Some(defect) => {
                    let kind = match defect.status {
                        DefectStatus::Active => TransitionKind::Persisted,
                        DefectStatus::Resolved => TransitionKind::Regressed,
                    };
                    defect.status = DefectStatus::Active;
                    defect.last_seen_run = run;
                    defect.severity = finding.severity;
                    defect.detail = finding.detail.clone();
                    kind
                }
            };
            transitions.push(Transition {
                kind,
                matching_key: key.clone(),
                rule_id: rule_id.to_string(),
                severity: finding.severity,
                run,
            });
        }

        for (rule_id, defect) in rules.iter_mut() {
            if found.contains_key(rule_id.as_str())
                || !evaluated.contains(rule_id)
                || !defect.is_active()
            {
                continue;
            }
            defect.status = DefectStatus::Resolved;
            defect.last_seen_run = run;
            transitions.push(Transition {
                kind: TransitionKind::Resolved,
                matching_key: key.clone(),
                rule_id: rule_id.clone(),
                severity: defect.severity,
                run,
            });
        }

        if rules.is_empty() {
            self.entries.remove(key);
        }
        Ok(transitions)
    }

    /// Checks the invariants a deserialised ledger must hold.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Schema`] naming the first inconsistent entry.
    pub fn check_consistency(&self) -> Result<(), LedgerError> {
        for (key, rules) in &self.entries {
            for (rule_id, defect) in rules {
                let at = format!("{key} / {rule_id}");
                if &defect.matching_key != key || &defect.rule_id != rule_id {
                    return Err(LedgerError::Schema(format!(
                        "{at}: entry is filed under the wrong key"
                    )));
                }
                if defect.first_seen_run > defect.last_seen_run {
                    return Err(LedgerError::Schema(format!(
                        "{at}: first_seen_run is after last_seen_run"
                    )));
                }
                if defect.last_seen_run > self.last_run {
                    return Err(LedgerError::Schema(format!(
                        "{at}: last_seen_run is after the ledger's last_run"
                    )));
                }
            }
        }
        Ok(())
    }
}
