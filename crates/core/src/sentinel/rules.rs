//! Audit rule catalog.
//!
//! Each rule is an independent object behind the [`Rule`] trait, so rules can be toggled per
//! run and tested in isolation. A rule looks at one document and reports at most one finding.

use crate::terminology::{
    BLOOD_PRESSURE_PANEL, BLOOD_PRESSURE_UNIT, DIASTOLIC_BP, HEART_RATE, HEART_RATE_UNIT,
    SYSTOLIC_BP,
};
use crate::{SentinelError, SentinelResult};
use chrono::{DateTime, Utc};
use fhir::{AnnotationKind, ClinicalDocument, Observation, Quantity};
use sentinel_types::nhs_number::validate_nhs_number;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks acceptance while Active.
    Clinical,
    /// Reported, never blocking.
    Administrative,
}

/// Run-wide inputs shared by every rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuditContext {
    pub now: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub detail: String,
}

pub trait Rule: Send + Sync {
    /// Stable identifier, used as the ledger key and in toggles.
    fn id(&self) -> &'static str;

    fn severity(&self) -> Severity;

    /// Returns a finding when `document` violates the rule.
    fn evaluate(&self, document: &ClinicalDocument, ctx: &AuditContext) -> Option<Finding>;
}

fn finding(rule: &dyn Rule, detail: String) -> Finding {
    Finding {
        rule_id: rule.id().to_string(),
        severity: rule.severity(),
        detail,
    }
}

// ============================================================================
// Predicate rules
// ============================================================================

type Check = fn(&ClinicalDocument, &AuditContext) -> Option<String>;

/// A rule whose whole logic is one check function.
struct PredicateRule {
    id: &'static str,
    severity: Severity,
    check: Check,
}

impl Rule for PredicateRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn severity(&self) -> Severity {
        self.severity
    }

    fn evaluate(&self, document: &ClinicalDocument, ctx: &AuditContext) -> Option<Finding> {
        (self.check)(document, ctx).map(|detail| finding(self, detail))
    }
}

fn nhs_checksum(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    let value = &doc.as_patient()?.nhs_number()?.value;
    (!value.is_empty() && !validate_nhs_number(value))
        .then(|| format!("NHS number {value:?} fails the modulus-11 check"))
}

fn nhs_missing(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    let patient = doc.as_patient()?;
    match patient.nhs_number() {
        Some(id) if !id.value.trim().is_empty() => None,
        _ => Some("patient has no NHS number".into()),
    }
}

fn family_missing(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    let patient = doc.as_patient()?;
    match patient.primary_name() {
        Some(name) if name.family.as_deref().is_some_and(|f| !f.trim().is_empty()) => None,
        _ => Some("patient's primary name has no family name".into()),
    }
}

fn birth_date_future(doc: &ClinicalDocument, ctx: &AuditContext) -> Option<String> {
    let born = doc.as_patient()?.birth_date?;
    (born > ctx.now.date_naive()).then(|| format!("birth date {born} is in the future"))
}

/// Detail of the mapper's note that the source value for `path` could not be read.
fn unparseable_note(doc: &ClinicalDocument, path: &str) -> Option<String> {
    doc.annotations
        .iter()
        .find(|a| a.kind == AnnotationKind::UnparseableValue && a.path == path)
        .map(|a| a.detail.clone())
}

fn birth_date_unparseable(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    doc.as_patient()?;
    unparseable_note(doc, "birthDate")
}

fn pulse_pressure(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    let obs = doc.as_observation()?;
    let systolic = vital_value(obs, SYSTOLIC_BP)?;
    let diastolic = vital_value(obs, DIASTOLIC_BP)?;
    (diastolic >= systolic)
        .then(|| format!("diastolic {diastolic} is not below systolic {systolic}"))
}

fn effective_future(doc: &ClinicalDocument, ctx: &AuditContext) -> Option<String> {
    let effective = doc.as_observation()?.effective_date_time?;
    (effective > ctx.now).then(|| format!("effective time {} is in the future", effective.to_rfc3339()))
}

fn effective_unparseable(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    doc.as_observation()?;
    unparseable_note(doc, "effectiveDateTime")
}

fn value_missing(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    let obs = doc.as_observation()?;
    if obs.has_code(HEART_RATE) {
        return obs
            .value()
            .is_none()
            .then(|| "heart rate has no value".into());
    }
    if obs.has_code(BLOOD_PRESSURE_PANEL) {
        let missing: Vec<&str> = [("systolic", SYSTOLIC_BP), ("diastolic", DIASTOLIC_BP)]
            .iter()
            .filter(|(_, code)| obs.component(code).and_then(|c| c.value()).is_none())
            .map(|(label, _)| *label)
            .collect();
        return (!missing.is_empty())
            .then(|| format!("blood pressure has no {} value", missing.join(" or ")));
    }
    None
}

fn allergy_code_missing(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    (!doc.as_allergy()?.has_allergen_code()).then(|| "allergy has no allergen code".into())
}

fn allergy_patient_missing(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    (!doc.as_allergy()?.has_patient_link()).then(|| "allergy is not linked to a patient".into())
}

fn encounter_subject_missing(doc: &ClinicalDocument, _: &AuditContext) -> Option<String> {
    let linked = doc
        .as_encounter()?
        .subject
        .as_ref()
        .is_some_and(|s| s.reference.is_some());
    (!linked).then(|| "encounter is not linked to a patient".into())
}

// ============================================================================
// Vital-sign rules
// ============================================================================

/// Quantity for `code`: the observation's own when it carries the code, else the component's.
fn vital_quantity<'a>(obs: &'a Observation, code: &str) -> Option<&'a Quantity> {
    if obs.has_code(code) {
        obs.value_quantity.as_ref()
    } else {
        obs.component(code)?.value_quantity.as_ref()
    }
}

fn vital_value(obs: &Observation, code: &str) -> Option<f64> {
    vital_quantity(obs, code)?.value
}

/// Flags a vital sign outside its physiologic bounds (inclusive).
struct RangeRule {
    id: &'static str,
    code: &'static str,
    label: &'static str,
    low: f64,
    high: f64,
}

impl Rule for RangeRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn severity(&self) -> Severity {
        Severity::Clinical
    }

    fn evaluate(&self, document: &ClinicalDocument, _: &AuditContext) -> Option<Finding> {
        let value = vital_value(document.as_observation()?, self.code)?;
        if (self.low..=self.high).contains(&value) {
            return None;
        }
        Some(finding(
            self,
            format!(
                "{} {value} outside {}..={}",
                self.label, self.low, self.high
            ),
        ))
    }
}

/// Flags a vital sign recorded in a unit other than the expected one.
struct UnitRule {
    id: &'static str,
    codes: &'static [&'static str],
    expected: &'static str,
}

impl Rule for UnitRule {
    fn id(&self) -> &'static str {
        self.id
    }

    fn severity(&self) -> Severity {
        Severity::Clinical
    }

    fn evaluate(&self, document: &ClinicalDocument, _: &AuditContext) -> Option<Finding> {
        let obs = document.as_observation()?;
        let wrong: Vec<String> = self
            .codes
            .iter()
            .filter_map(|code| vital_quantity(obs, code).map(|q| (code, q)))
            .filter(|(_, q)| q.unit.as_deref() != Some(self.expected))
            .map(|(code, q)| format!("{code} in {:?}", q.unit.as_deref().unwrap_or("")))
            .collect();
        (!wrong.is_empty()).then(|| {
            finding(
                self,
                format!("expected {:?}, found {}", self.expected, wrong.join(", ")),
            )
        })
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// The rules a run evaluates, with per-run toggles.
pub struct RuleCatalog {
    rules: Vec<Box<dyn Rule>>,
    disabled: BTreeSet<String>,
}

impl RuleCatalog {
    /// Every built-in rule, all enabled.
    pub fn standard() -> Self {
        use Severity::{Administrative, Clinical};
        let predicate = |id, severity, check: Check| -> Box<dyn Rule> {
            Box::new(PredicateRule {
                id,
                severity,
                check,
            })
        };
        let range = |id, code, label, low, high| -> Box<dyn Rule> {
            Box::new(RangeRule {
                id,
                code,
                label,
                low,
                high,
            })
        };

        let rules: Vec<Box<dyn Rule>> = vec![
            predicate("patient.nhs-number.checksum", Administrative, nhs_checksum),
            predicate("patient.nhs-number.missing", Administrative, nhs_missing),
            predicate("patient.family-name.missing", Administrative, family_missing),
            predicate("patient.birth-date.future", Administrative, birth_date_future),
            predicate("patient.birth-date.unparseable", Administrative, birth_date_unparseable),
            range("observation.heart-rate.range", HEART_RATE, "heart rate", 0.0, 300.0),
            Box::new(UnitRule {
                id: "observation.heart-rate.unit",
                codes: &[HEART_RATE],
                expected: HEART_RATE_UNIT,
            }),
            range("observation.systolic.range", SYSTOLIC_BP, "systolic", 50.0, 300.0),
            range("observation.diastolic.range", DIASTOLIC_BP, "diastolic", 40.0, 200.0),
            Box::new(UnitRule {
                id: "observation.blood-pressure.unit",
                codes: &[SYSTOLIC_BP, DIASTOLIC_BP],
                expected: BLOOD_PRESSURE_UNIT,
            }),
            predicate("observation.pulse-pressure", Clinical, pulse_pressure),
            predicate("observation.effective.future", Clinical, effective_future),
            predicate("observation.effective.unparseable", Clinical, effective_unparseable),
            predicate("observation.value.missing", Clinical, value_missing),
            predicate("allergy.code.missing", Clinical, allergy_code_missing),
            predicate("allergy.patient.missing", Administrative, allergy_patient_missing),
            predicate("encounter.subject.missing", Administrative, encounter_subject_missing),
        ];

        Self {
            rules,
            disabled: BTreeSet::new(),
        }
    }

    /// All rule ids, in evaluation order.
    pub fn ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.id()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.iter().any(|r| r.id() == id)
    }

    /// Fails on the first id that names no rule.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::InvalidConfig`].
    pub fn check_known(&self, ids: &BTreeSet<String>) -> SentinelResult<()> {
        match ids.iter().find(|id| !self.contains(id)) {
            Some(unknown) => Err(SentinelError::InvalidConfig(format!(
                "unknown rule id {unknown:?}"
            ))),
            None => Ok(()),
        }
    }

    /// Disable `ids` for subsequent evaluations.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::InvalidConfig`] if any id is unknown; nothing is disabled then.
    pub fn with_disabled(mut self, ids: &BTreeSet<String>) -> SentinelResult<Self> {
        self.check_known(ids)?;
        self.disabled = ids.clone();
        Ok(self)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.contains(id) && !self.disabled.contains(id)
    }

    /// Ids of the rules that run.
    pub fn enabled_ids(&self) -> BTreeSet<String> {
        self.enabled().map(|r| r.id().to_string()).collect()
    }

    fn enabled(&self) -> impl Iterator<Item = &dyn Rule> {
        self.rules
            .iter()
            .map(|r| r.as_ref())
            .filter(|r| !self.disabled.contains(r.id()))
    }

    /// Findings of every enabled rule against `document`, in catalog order.
    pub fn evaluate(&self, document: &ClinicalDocument, ctx: &AuditContext) -> Vec<Finding> {
        self.enabled()
            .filter_map(|rule| rule.evaluate(document, ctx))
            .collect()
    }
}

impl std::fmt::Debug for RuleCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleCatalog")
            .field("rules", &self.ids())
            .field("disabled", &self.disabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{inject, ChaosRequest, DefectKind};
    use crate::mapper::map_message;
    use crate::testing::{bp_message, hr_message, ADT_A01, ORU_HR};
    use chrono::TimeZone;
    use fhir::Bundle;

    fn bundle(text: &str) -> Bundle {
        map_message(&hl7::parse(text).expect("parse")).expect("map")
    }

    fn ctx() -> AuditContext {
        AuditContext {
            now: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        }
    }

    fn fired(doc: &ClinicalDocument) -> Vec<String> {
        RuleCatalog::standard()
            .evaluate(doc, &ctx())
            .into_iter()
            .map(|f| f.rule_id)
            .collect()
    }

    #[test]
    fn catalog_has_seventeen_unique_rules() {
        let catalog = RuleCatalog::standard();
        let ids = catalog.ids();
        assert_eq!(ids.len(), 17);
        assert_eq!(ids.iter().collect::<BTreeSet<_>>().len(), 17);
        assert!(catalog.contains("observation.heart-rate.range"));
    }

    #[test]
    fn clean_messages_raise_nothing() {
        for doc in bundle(ADT_A01).entry.iter().chain(bundle(ORU_HR).entry.iter()) {
            assert!(fired(doc).is_empty(), "{}: {:?}", doc.matching_key, fired(doc));
        }
        for doc in &bundle(&bp_message("1", "128", "84")).entry {
            assert!(fired(doc).is_empty());
        }
    }

    #[test]
    fn heart_rate_bounds() {
        let out_of_range = bundle(&hr_message("1", "9434767067", "999"));
        assert_eq!(fired(&out_of_range.entry[1]), vec!["observation.heart-rate.range"]);

        let edge = bundle(&hr_message("1", "9434767067", "300"));
        assert!(fired(&edge.entry[1]).is_empty());

        let missing = bundle(&hr_message("1", "9434767067", ""));
        assert_eq!(fired(&missing.entry[1]), vec!["observation.value.missing"]);
    }

    #[test]
    fn blood_pressure_rules() {
        let inverted = bundle(&bp_message("1", "80", "90"));
        assert_eq!(fired(&inverted.entry[1]), vec!["observation.pulse-pressure"]);

        let extreme = bundle(&bp_message("1", "320", "30"));
        assert_eq!(
            fired(&extreme.entry[1]),
            vec!["observation.systolic.range", "observation.diastolic.range"]
        );
    }

    #[test]
    fn checksum_rule_is_administrative() {
        let bad = bundle(&hr_message("1", "9434767060", "72"));
        let findings = RuleCatalog::standard().evaluate(&bad.entry[0], &ctx());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "patient.nhs-number.checksum");
        assert_eq!(findings[0].severity, Severity::Administrative);
        assert!(findings[0].detail.contains("9434767060"));
    }

    #[test]
    fn chaos_mutations_are_detected() {
        let docs = bundle(ADT_A01);
        let expectations = [
            (0, DefectKind::MandatoryFieldRemoved, "patient.family-name.missing"),
            (0, DefectKind::TemporalImpossible, "patient.birth-date.future"),
            (1, DefectKind::MandatoryFieldRemoved, "encounter.subject.missing"),
        ];
        for (idx, kind, rule) in expectations {
            let request = ChaosRequest::new(1, 1, ctx().now).only(kind);
            let (mutated, _) = inject(&docs.entry[idx], &request);
            assert_eq!(fired(&mutated), vec![rule]);
        }

        let hr = &bundle(ORU_HR).entry[1];
        let request = ChaosRequest::new(1, 1, ctx().now).only(DefectKind::UnitMismatch);
        let (mutated, _) = inject(hr, &request);
        assert_eq!(fired(&mutated), vec!["observation.heart-rate.unit"]);

        let request = ChaosRequest::new(1, 1, ctx().now).only(DefectKind::TemporalImpossible);
        let (mutated, _) = inject(hr, &request);
        assert_eq!(fired(&mutated), vec!["observation.effective.future"]);
    }

    #[test]
    fn unreadable_birth_date_is_administrative() {
        let text = hr_message("1", "9434767067", "72").replace("|19800101|", "|19801301|");
        let docs = bundle(&text);
        assert!(docs.entry[0].as_patient().is_some_and(|p| p.birth_date.is_none()));

        let findings = RuleCatalog::standard().evaluate(&docs.entry[0], &ctx());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "patient.birth-date.unparseable");
        assert_eq!(findings[0].severity, Severity::Administrative);
        assert!(findings[0].detail.contains("19801301"), "{}", findings[0].detail);
        assert!(fired(&docs.entry[1]).is_empty());
    }

    #[test]
    fn unreadable_effective_time_is_clinical() {
        let text = hr_message("1", "9434767067", "72")
            .replace("signs|||202401050930", "signs|||garbage");
        let docs = bundle(&text);
        assert!(fired(&docs.entry[0]).is_empty());

        let findings = RuleCatalog::standard().evaluate(&docs.entry[1], &ctx());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "observation.effective.unparseable");
        assert_eq!(findings[0].severity, Severity::Clinical);
        assert!(findings[0].detail.contains("garbage"), "{}", findings[0].detail);

        let text = bp_message("1", "128", "84").replace("signs|||202401051015", "signs|||2024-1");
        let panel = bundle(&text);
        assert_eq!(fired(&panel.entry[1]), vec!["observation.effective.unparseable"]);
    }

    #[test]
    fn disabled_rules_do_not_run() {
        let doc = &bundle(&hr_message("1", "9434767067", "999")).entry[1];
        let catalog = RuleCatalog::standard()
            .with_disabled(&BTreeSet::from(["observation.heart-rate.range".to_string()]))
            .unwrap();
        assert!(catalog.evaluate(doc, &ctx()).is_empty());
        assert!(!catalog.is_enabled("observation.heart-rate.range"));
        assert_eq!(catalog.enabled_ids().len(), 16);
    }

    #[test]
    fn unknown_rule_ids_are_rejected() {
        let err = RuleCatalog::standard()
            .with_disabled(&BTreeSet::from(["no.such.rule".to_string()]))
            .unwrap_err();
        assert!(err.to_string().contains("no.such.rule"));
    }
}
