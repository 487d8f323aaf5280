//! Parse → map → (chaos) → audit, per message and per run.
//!
//! Each message runs to completion, reconciliation included, before the next one starts, so a
//! caller may stop between messages without leaving the ledger half-updated. A message that
//! cannot be parsed, mapped or reconciled becomes [`Outcome::FailedIngest`] and never aborts the
//! batch.

use crate::chaos::{infect_bundle, ChaosConfig, ChaosManifest};
use crate::config::CoreConfig;
use crate::mapper::map_message;
use crate::sentinel::{
    AuditContext, AuditReport, DefectLedger, RuleCatalog, RunId, Sentinel, TransitionKind,
    Verdict,
};
use crate::volume::{InboundMessage, SharedVolume};
use crate::{SentinelError, SentinelResult};
use chrono::{DateTime, Utc};
use fhir::Bundle;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Parse,
    Map,
    /// The ledger refused the message's findings (e.g. a stale run for one of its keys).
    Audit,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Audited {
        /// The bundle as audited (after chaos, when enabled).
        bundle: Bundle,
        manifests: Vec<ChaosManifest>,
        report: AuditReport,
    },
    FailedIngest {
        stage: IngestStage,
        error: String,
    },
}

impl Outcome {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Outcome::Audited { report, .. } => Some(report.verdict),
            Outcome::FailedIngest { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageResult {
    pub name: String,
    pub outcome: Outcome,
}

/// Counters for one run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: RunId,
    pub audited_at: DateTime<Utc>,
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed_ingest: usize,
    /// Active defects in the whole ledger after the run.
    pub active_defects: usize,
    pub new_this_run: usize,
    pub resolved_this_run: usize,
    pub regressed_this_run: usize,
}

impl RunSummary {
    fn new(run: RunId, audited_at: DateTime<Utc>) -> Self {
        Self {
            run,
            audited_at,
            processed: 0,
            accepted: 0,
            rejected: 0,
            failed_ingest: 0,
            active_defects: 0,
            new_this_run: 0,
            resolved_this_run: 0,
            regressed_this_run: 0,
        }
    }

    /// Accepted share of audited messages, as a whole percentage.
    pub fn acceptance_percent(&self) -> u8 {
        let audited = self.accepted + self.rejected;
        if audited == 0 {
            return 0;
        }
        u8::try_from(self.accepted * 100 / audited).unwrap_or(100)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    pub summary: RunSummary,
    pub results: Vec<MessageResult>,
}

impl RunReport {
    /// Every audited document of the run, in message order.
    pub fn documents(&self) -> impl Iterator<Item = &fhir::ClinicalDocument> {
        self.results.iter().flat_map(|r| match &r.outcome {
            Outcome::Audited { bundle, .. } => bundle.entry.as_slice(),
            Outcome::FailedIngest { .. } => &[][..],
        })
    }
}

#[derive(Debug)]
pub struct Pipeline {
    sentinel: Sentinel,
    chaos: ChaosConfig,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(sentinel: Sentinel, chaos: ChaosConfig, batch_size: usize) -> Self {
        Self {
            sentinel,
            chaos,
            batch_size: batch_size.max(1),
        }
    }

    /// # Errors
    ///
    /// Returns [`crate::SentinelError::InvalidConfig`] if the configuration names an unknown
    /// rule.
    pub fn from_config(config: &CoreConfig) -> SentinelResult<Self> {
        let catalog = RuleCatalog::standard().with_disabled(config.disabled_rules())?;
        Ok(Self::new(
            Sentinel::new(catalog),
            config.chaos().clone(),
            config.batch_size(),
        ))
    }

    pub fn sentinel(&self) -> &Sentinel {
        &self.sentinel
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Chaos (when enabled) then audit, for an already mapped bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if the chaos settings are invalid or the run is stale for the ledger.
    pub fn audit_bundle(
        &self,
        bundle: &Bundle,
        ledger: &mut DefectLedger,
        run: RunId,
        now: DateTime<Utc>,
    ) -> SentinelResult<Outcome> {
        let (bundle, manifests) = infect_bundle(bundle, &self.chaos, run, now)?;
        let report =
            self.sentinel
                .audit_message(&bundle.entry, ledger, run, &AuditContext { now })?;
        Ok(Outcome::Audited {
            bundle,
            manifests,
            report,
        })
    }

    /// Run one message through the whole pipeline.
    ///
    /// # Errors
    ///
    /// Parse, mapping and ledger failures are not errors; they come back as
    /// [`Outcome::FailedIngest`] and leave the ledger untouched. Errors are reserved for
    /// conditions that stop the run, such as invalid chaos settings.
    pub fn process_message(
        &self,
        text: &str,
        ledger: &mut DefectLedger,
        run: RunId,
        now: DateTime<Utc>,
    ) -> SentinelResult<Outcome> {
        let message = match hl7::parse(text) {
            Ok(m) => m,
            Err(e) => {
                return Ok(Outcome::FailedIngest {
                    stage: IngestStage::Parse,
                    error: e.to_string(),
                })
            }
        };
        let bundle = match map_message(&message) {
            Ok(b) => b,
            Err(e) => {
                return Ok(Outcome::FailedIngest {
                    stage: IngestStage::Map,
                    error: e.to_string(),
                })
            }
        };
        match self.audit_bundle(&bundle, ledger, run, now) {
            Err(SentinelError::Ledger(e)) => Ok(Outcome::FailedIngest {
                stage: IngestStage::Audit,
                error: e.to_string(),
            }),
            other => other,
        }
    }

    /// Process at most [`Self::batch_size`] messages as one new run.
    ///
    /// # Errors
    ///
    /// Returns the first error that stops the run; messages already processed stay reconciled.
    pub fn run_batch(
        &self,
        messages: &[InboundMessage],
        ledger: &mut DefectLedger,
        now: DateTime<Utc>,
    ) -> SentinelResult<RunReport> {
        let run = ledger.begin_run();
        let mut summary = RunSummary::new(run, now);
        let mut results = Vec::new();

        for message in messages.iter().take(self.batch_size) {
            let outcome = self.process_message(&message.text, ledger, run, now)?;
            summary.processed += 1;
            match &outcome {
                Outcome::FailedIngest { stage, error } => {
                    summary.failed_ingest += 1;
                    tracing::warn!(name = %message.name, ?stage, %error, "failed ingest");
                }
                Outcome::Audited { report, .. } => {
                    match report.verdict {
                        Verdict::Accepted => summary.accepted += 1,
                        Verdict::Rejected => summary.rejected += 1,
                    }
                    summary.new_this_run += report.count(TransitionKind::Opened);
                    summary.resolved_this_run += report.count(TransitionKind::Resolved);
                    summary.regressed_this_run += report.count(TransitionKind::Regressed);
                }
            }
            results.push(MessageResult {
                name: message.name.clone(),
                outcome,
            });
        }

        summary.active_defects = ledger.active().count();
        Ok(RunReport { summary, results })
    }
}

/// Window of at most `batch_size` files for `run`, rotating through the inbound files so every
/// file is revisited when there are more files than fit in one run.
pub fn select_batch(files: &[PathBuf], run: RunId, batch_size: usize) -> Vec<PathBuf> {
    if files.len() <= batch_size {
        return files.to_vec();
    }
    let start = usize::try_from(run.get().saturating_sub(1))
        .unwrap_or(0)
        .wrapping_mul(batch_size)
        % files.len();
    files
        .iter()
        .cycle()
        .skip(start)
        .take(batch_size)
        .cloned()
        .collect()
}

/// One scheduled run against the shared volume.
///
/// Reads the run's window of inbound files, audits them into `ledger`, writes every bundle to
/// `raw/` with a copy in `accepted/` or `rejected/`, then saves the ledger.
///
/// # Errors
///
/// Returns [`crate::SentinelError`] on filesystem failures or a run-stopping pipeline error.
pub fn execute_run(
    pipeline: &Pipeline,
    volume: &SharedVolume,
    ledger: &mut DefectLedger,
    now: DateTime<Utc>,
) -> SentinelResult<RunReport> {
    volume.ensure_layout()?;
    let files = volume.list_inbound()?;
    let selected = select_batch(&files, ledger.next_run(), pipeline.batch_size());
    let messages = selected
        .iter()
        .map(|path| volume.read_message(path))
        .collect::<SentinelResult<Vec<_>>>()?;

    let report = pipeline.run_batch(&messages, ledger, now)?;

    for result in &report.results {
        if let Outcome::Audited { bundle, report, .. } = &result.outcome {
            let raw = volume.write_bundle(&result.name, bundle)?;
            volume.file_verdict(&raw, report.verdict)?;
        }
    }
    volume.save_ledger(ledger)?;

    let s = &report.summary;
    tracing::info!(
        run = %s.run,
        processed = s.processed,
        accepted = s.accepted,
        rejected = s.rejected,
        failed_ingest = s.failed_ingest,
        active_defects = s.active_defects,
        new = s.new_this_run,
        resolved = s.resolved_this_run,
        regressed = s.regressed_this_run,
        "run complete"
    );
    Ok(report)
}
