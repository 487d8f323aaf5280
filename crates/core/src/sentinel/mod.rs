//! The auditor.
//!
//! Evaluates every enabled rule against each document of a message, reconciles the findings
//! into the [`DefectLedger`] one matching key at a time, and returns the message verdict.
//!
//! A message is [`Verdict::Rejected`] when any of its matching keys carries an Active clinical
//! defect after reconciliation. Administrative defects are recorded and reported but never
//! block acceptance.

pub mod ledger;
pub mod rules;
pub mod store;

pub use ledger::{
    Defect, DefectLedger, DefectStatus, LedgerError, RunId, Transition, TransitionKind,
};
pub use rules::{AuditContext, Finding, Rule, RuleCatalog, Severity};
pub use store::LedgerStore;

use fhir::{ClinicalDocument, MatchingKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accepted,
    Rejected,
}

/// Result of auditing one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub verdict: Verdict,
    pub transitions: Vec<Transition>,
    /// Ledger state, after reconciliation, of every defect a transition touched.
    pub touched: Vec<Defect>,
}

impl AuditReport {
    pub fn count(&self, kind: TransitionKind) -> usize {
        self.transitions.iter().filter(|t| t.kind == kind).count()
    }
}

#[derive(Debug)]
pub struct Sentinel {
    catalog: RuleCatalog,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new(RuleCatalog::standard())
    }
}

impl Sentinel {
    pub fn new(catalog: RuleCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Audit the documents of one message against the ledger.
    ///
    /// Every matching key is checked for staleness before any entry is written, so a refused
    /// message leaves the ledger unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::StaleRun`] if `run` is older than a run already recorded for any
    /// of the message's matching keys.
    pub fn audit_message(
        &self,
        documents: &[ClinicalDocument],
        ledger: &mut DefectLedger,
        run: RunId,
        ctx: &AuditContext,
    ) -> Result<AuditReport, LedgerError> {
        let mut findings: BTreeMap<&MatchingKey, Vec<Finding>> = BTreeMap::new();
        for document in documents {
            findings
                .entry(&document.matching_key)
                .or_default()
                .extend(self.catalog.evaluate(document, ctx));
        }

        for key in findings.keys() {
            ledger.check_run(key, run)?;
        }

        let evaluated = self.catalog.enabled_ids();
        let mut transitions = Vec::new();
        for (key, found) in &findings {
            let applied = ledger.reconcile(key, found, &evaluated, run)?;
            for t in &applied {
                tracing::debug!(
                    matching_key = %t.matching_key,
                    rule_id = %t.rule_id,
                    transition = ?t.kind,
                    run = %run,
                    "defect transition"
                );
            }
            transitions.extend(applied);
        }

        let touched = transitions
            .iter()
            .filter_map(|t| ledger.get(&t.matching_key, &t.rule_id).cloned())
            .collect();
        let verdict = if findings.keys().any(|key| ledger.has_blocking(key)) {
            Verdict::Rejected
        } else {
            Verdict::Accepted
        };

        Ok(AuditReport {
            verdict,
            transitions,
            touched,
        })
    }
}
