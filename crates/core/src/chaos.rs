//! Seeded corruption injector.
//!
//! Mutates mapped documents at the value level so the auditor has something to find. Every
//! mutation keeps the document structurally valid: fields are overwritten or cleared, never
//! given a different shape.
//!
//! Given the same `(document, seed, count)` the injector always picks the same mutation sites
//! and produces byte-identical output. The returned [`ChaosManifest`] is a test oracle only;
//! nothing in the audit path reads it.

use crate::constants::{DEFAULT_CHAOS_DEFECTS, DEFAULT_CHAOS_RATE, DEFAULT_CHAOS_SEED};
use crate::sentinel::ledger::RunId;
use crate::{SentinelError, SentinelResult};
use chrono::{DateTime, Duration, Utc};
use fhir::{Bundle, ClinicalDocument, MatchingKey, Observation, Quantity, Resource};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sentinel_types::nhs_number::{self, NhsNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Value forced onto numeric fields by [`DefectKind::NumericOutOfRange`].
pub const OUT_OF_RANGE_VALUE: f64 = 999.0;

/// Unit forced onto quantities by [`DefectKind::UnitMismatch`].
pub const MISMATCHED_UNIT: &str = "kg";

/// How far past the reference time [`DefectKind::TemporalImpossible`] moves a timestamp.
pub const FUTURE_OFFSET_DAYS: i64 = 365;

/// The mutation catalog, in application order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefectKind {
    NumericOutOfRange,
    TemporalImpossible,
    IdentifierChecksumCorrupt,
    MandatoryFieldRemoved,
    UnitMismatch,
}

impl DefectKind {
    pub const ALL: [DefectKind; 5] = [
        DefectKind::NumericOutOfRange,
        DefectKind::TemporalImpossible,
        DefectKind::IdentifierChecksumCorrupt,
        DefectKind::MandatoryFieldRemoved,
        DefectKind::UnitMismatch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DefectKind::NumericOutOfRange => "numeric-out-of-range",
            DefectKind::TemporalImpossible => "temporal-impossible",
            DefectKind::IdentifierChecksumCorrupt => "identifier-checksum-corrupt",
            DefectKind::MandatoryFieldRemoved => "mandatory-field-removed",
            DefectKind::UnitMismatch => "unit-mismatch",
        }
    }
}

impl std::fmt::Display for DefectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call to [`inject`].
#[derive(Clone, Debug, PartialEq)]
pub struct ChaosRequest {
    pub seed: u64,
    /// Number of mutation sites to pick. Fewer are applied when the document has fewer sites.
    pub count: usize,
    /// "Now" for temporal mutations; passed in so output never depends on the wall clock.
    pub reference_time: DateTime<Utc>,
    /// Restricts the catalog; empty means every kind.
    pub kinds: BTreeSet<DefectKind>,
}

impl ChaosRequest {
    pub fn new(seed: u64, count: usize, reference_time: DateTime<Utc>) -> Self {
        Self {
            seed,
            count,
            reference_time,
            kinds: BTreeSet::new(),
        }
    }

    /// Limit the request to a single kind.
    pub fn only(mut self, kind: DefectKind) -> Self {
        self.kinds = BTreeSet::from([kind]);
        self
    }
}

/// One mutation that changed the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedDefect {
    pub kind: DefectKind,
    /// Resource-relative path, e.g. `identifier[0].value`.
    pub path: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosManifest {
    pub matching_key: MatchingKey,
    pub seed: u64,
    pub injected: Vec<InjectedDefect>,
}

/// Pipeline-level chaos settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosConfig {
    pub enabled: bool,
    pub defects_per_document: usize,
    /// Probability in `0.0..=1.0` that a given document is infected.
    pub infection_rate: f64,
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            defects_per_document: DEFAULT_CHAOS_DEFECTS,
            infection_rate: DEFAULT_CHAOS_RATE,
            seed: DEFAULT_CHAOS_SEED,
        }
    }
}

impl ChaosConfig {
    /// # Errors
    ///
    /// Returns [`SentinelError::InvalidConfig`] if the infection rate is outside `0.0..=1.0`.
    pub fn validate(&self) -> SentinelResult<()> {
        if !(0.0..=1.0).contains(&self.infection_rate) {
            return Err(SentinelError::InvalidConfig(format!(
                "chaos infection rate must be within 0.0..=1.0, got {}",
                self.infection_rate
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Mutation sites
// ============================================================================

/// Where a mutation lands. `Option<usize>` selects an observation component; `None` is the
/// observation's own quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Identifier,
    BirthDate,
    FamilyName,
    Value(Option<usize>),
    Unit(Option<usize>),
    Effective,
    Subject,
    AllergyCode,
    AllergyPatient,
}

impl Target {
    fn path(self) -> String {
        let quantity = |component: Option<usize>| match component {
            Some(idx) => format!("component[{idx}].valueQuantity"),
            None => "valueQuantity".to_string(),
        };
        match self {
            Target::Identifier => "identifier[0].value".into(),
            Target::BirthDate => "birthDate".into(),
            Target::FamilyName => "name[0].family".into(),
            Target::Value(c) => format!("{}.value", quantity(c)),
            Target::Unit(c) => format!("{}.unit", quantity(c)),
            Target::Effective => "effectiveDateTime".into(),
            Target::Subject => "subject".into(),
            Target::AllergyCode => "code".into(),
            Target::AllergyPatient => "patient".into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Site {
    kind: DefectKind,
    target: Target,
}

/// Quantity slots of an observation: its own value, then each component's.
fn quantity_slots(observation: &Observation) -> Vec<Option<usize>> {
    let own = observation.value_quantity.as_ref().map(|_| None);
    let components = observation
        .component
        .iter()
        .enumerate()
        .filter(|(_, c)| c.value_quantity.is_some())
        .map(|(idx, _)| Some(idx));
    own.into_iter().chain(components).collect()
}

/// Every applicable mutation site, in catalog order.
fn sites(document: &ClinicalDocument) -> Vec<Site> {
    use DefectKind::*;
    let site = |kind, target| Site { kind, target };
    let mut sites = Vec::new();

    match &document.resource {
        Resource::Patient(patient) => {
            sites.push(site(TemporalImpossible, Target::BirthDate));
            if patient
                .nhs_number()
                .and_then(|id| NhsNumber::parse(&id.value))
                .is_some()
            {
                sites.push(site(IdentifierChecksumCorrupt, Target::Identifier));
            }
            if patient.primary_name().is_some() {
                sites.push(site(MandatoryFieldRemoved, Target::FamilyName));
            }
        }
        Resource::Observation(observation) => {
            let slots = quantity_slots(observation);
            sites.extend(slots.iter().map(|&c| site(NumericOutOfRange, Target::Value(c))));
            sites.push(site(TemporalImpossible, Target::Effective));
            sites.extend(slots.iter().map(|&c| site(MandatoryFieldRemoved, Target::Value(c))));
            sites.extend(slots.iter().map(|&c| site(UnitMismatch, Target::Unit(c))));
        }
        Resource::Encounter(_) => sites.push(site(MandatoryFieldRemoved, Target::Subject)),
        Resource::AllergyIntolerance(_) => {
            sites.push(site(MandatoryFieldRemoved, Target::AllergyCode));
            sites.push(site(MandatoryFieldRemoved, Target::AllergyPatient));
        }
    }

    sites.sort_by_key(|s| s.kind);
    sites
}

// ============================================================================
// Injection
// ============================================================================

/// Mutate a copy of `document` at `request.count` seeded sites.
///
/// Sites are sampled without replacement, then applied in catalog order. Only mutations that
/// actually changed a value appear in the manifest, so applying the same request to an
/// already-mutated document records nothing new.
pub fn inject(
    document: &ClinicalDocument,
    request: &ChaosRequest,
) -> (ClinicalDocument, ChaosManifest) {
    let mut rng = StdRng::seed_from_u64(request.seed);

    let candidates: Vec<Site> = sites(document)
        .into_iter()
        .filter(|s| request.kinds.is_empty() || request.kinds.contains(&s.kind))
        .collect();
    let mut picked: Vec<usize> = (0..candidates.len())
        .collect::<Vec<_>>()
        .choose_multiple(&mut rng, request.count)
        .copied()
        .collect();
    picked.sort_unstable();

    let mut mutated = document.clone();
    let injected = picked
        .into_iter()
        .filter_map(|idx| apply(&mut mutated, candidates[idx], &mut rng, request.reference_time))
        .collect();

    let manifest = ChaosManifest {
        matching_key: document.matching_key.clone(),
        seed: request.seed,
        injected,
    };
    (mutated, manifest)
}

fn quantity_mut(
    observation: &mut Observation,
    component: Option<usize>,
) -> Option<&mut Quantity> {
    match component {
        None => observation.value_quantity.as_mut(),
        Some(idx) => observation.component.get_mut(idx)?.value_quantity.as_mut(),
    }
}

fn render_value(value: Option<f64>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn apply(
    document: &mut ClinicalDocument,
    site: Site,
    rng: &mut StdRng,
    reference_time: DateTime<Utc>,
) -> Option<InjectedDefect> {
    let future = reference_time + Duration::days(FUTURE_OFFSET_DAYS);

    let (before, after) = match (&mut document.resource, site.target) {
        (Resource::Patient(patient), Target::Identifier) => {
            let identifier = patient.nhs_number_mut()?;
            let number = NhsNumber::parse(&identifier.value)?;
            if !number.is_valid() {
                return None;
            }
            let failing: Vec<u8> = (0..=9)
                .filter(|&d| !nhs_number::validate(number.body(), d))
                .collect();
            let corrupted = number.with_check_digit(*failing.choose(rng)?)?;
            let before = std::mem::replace(&mut identifier.value, corrupted.to_string());
            (Some(before), Some(identifier.value.clone()))
        }
        (Resource::Patient(patient), Target::BirthDate) => {
            let target = future.date_naive();
            if patient.birth_date == Some(target) {
                return None;
            }
            let before = patient.birth_date.replace(target);
            (before.map(|d| d.to_string()), Some(target.to_string()))
        }
        (Resource::Patient(patient), Target::FamilyName) => {
            let family = patient.name.first_mut()?.family.take()?;
            (Some(family), None)
        }
        (Resource::Observation(observation), Target::Value(c)) => {
            let quantity = quantity_mut(observation, c)?;
            match site.kind {
                DefectKind::MandatoryFieldRemoved => {
                    (render_value(Some(quantity.value.take()?)), None)
                }
                _ => {
                    if quantity.value == Some(OUT_OF_RANGE_VALUE) {
                        return None;
                    }
                    let before = quantity.value.replace(OUT_OF_RANGE_VALUE);
                    (render_value(before), render_value(quantity.value))
                }
            }
        }
        (Resource::Observation(observation), Target::Unit(c)) => {
            let quantity = quantity_mut(observation, c)?;
            if quantity.unit.as_deref() == Some(MISMATCHED_UNIT) {
                return None;
            }
            quantity.code = Some(MISMATCHED_UNIT.to_string());
            let before = quantity.unit.replace(MISMATCHED_UNIT.to_string());
            (before, Some(MISMATCHED_UNIT.to_string()))
        }
        (Resource::Observation(observation), Target::Effective) => {
            if observation.effective_date_time == Some(future) {
                return None;
            }
            let before = observation.effective_date_time.replace(future);
            (before.map(|t| t.to_rfc3339()), Some(future.to_rfc3339()))
        }
        (Resource::Encounter(encounter), Target::Subject) => {
            (encounter.subject.take()?.reference, None)
        }
        (Resource::AllergyIntolerance(allergy), Target::AllergyCode) => {
            let code = allergy.code.take()?;
            (code.first_code().map(str::to_string), None)
        }
        (Resource::AllergyIntolerance(allergy), Target::AllergyPatient) => {
            (allergy.patient.take()?.reference, None)
        }
        _ => return None,
    };

    Some(InjectedDefect {
        kind: site.kind,
        path: site.target.path(),
        before,
        after,
    })
}

/// FNV-1a over the seed, run and key, so each document in each run draws independently.
fn document_seed(seed: u64, run: RunId, key: &MatchingKey) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    seed.to_le_bytes()
        .iter()
        .chain(run.get().to_le_bytes().iter())
        .chain(key.as_str().as_bytes())
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

/// Apply chaos to every document of a bundle according to `config`.
///
/// Returns the (possibly) mutated bundle and one manifest per infected document.
///
/// # Errors
///
/// Returns [`SentinelError::InvalidConfig`] if `config` does not validate.
pub fn infect_bundle(
    bundle: &Bundle,
    config: &ChaosConfig,
    run: RunId,
    reference_time: DateTime<Utc>,
) -> SentinelResult<(Bundle, Vec<ChaosManifest>)> {
    config.validate()?;
    if !config.enabled {
        return Ok((bundle.clone(), Vec::new()));
    }

    let mut infected = bundle.clone();
    let mut manifests = Vec::new();
    for document in &mut infected.entry {
        let seed = document_seed(config.seed, run, &document.matching_key);
        if !StdRng::seed_from_u64(seed).gen_bool(config.infection_rate) {
            continue;
        }
        let request = ChaosRequest::new(seed, config.defects_per_document, reference_time);
        let (mutated, manifest) = inject(document, &request);
        tracing::debug!(
            matching_key = %manifest.matching_key,
            injected = manifest.injected.len(),
            "chaos infected document"
        );
        *document = mutated;
        manifests.push(manifest);
    }
    Ok((infected, manifests))
}
