//! Legacy message → clinical resource documents.
//!
//! Responsibilities:
//! - route a parsed message to the resources it describes (always a Patient; an Encounter and
//!   allergies for `ADT`; vital-sign observations for `ORU`)
//! - read every source value through [`crate::mapping_table`] and translate codes through
//!   [`crate::terminology`]
//! - derive each document's [`MatchingKey`] from raw source fields only
//!
//! Only identity failures are errors ([`MappingError`]): a missing `PID` segment, an empty
//! `PID-3.1` or an empty `MSH-10`. Every other gap leaves the destination absent and adds an
//! [`Annotation`] to the document.

use crate::mapping_table::{self as table, FieldMapping, MAPPING_VERSION};
use crate::terminology as terms;
use crate::MappingError;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use fhir::{
    Address, AllergyIntolerance, AllergyReaction, Annotation, AnnotationKind, Bundle,
    ClinicalDocument, CodeableConcept, Coding, ContactPoint, Encounter, EncounterLocation,
    EncounterParticipant, HumanName, Identifier, MatchingKey, NameUse, Observation,
    ObservationComponent, Patient, Quantity, Reference, Resource, ResourceType,
    NHS_NUMBER_SYSTEM,
};
use hl7::{ComponentRef, Delimiters, Message, Repetition, Segment};
use sentinel_types::NhsNumber;
use std::collections::HashMap;

/// Map one parsed message to a bundle of documents.
///
/// Mapping the same message twice yields identical bundles.
///
/// # Errors
///
/// Returns [`MappingError`] when the message cannot express a distinguishable identity.
pub fn map_message(message: &Message) -> Result<Bundle, MappingError> {
    let header = message.header();
    let control_id = table::MESSAGE_CONTROL_ID
        .value(header)
        .ok_or_else(|| MappingError::new("MSH-10", "message control id is empty"))?;
    let (code, trigger) = message.message_type();

    let pid = message
        .require("PID")
        .map_err(|_| MappingError::new("PID", "patient identification segment is missing"))?;
    let nhs_raw = table::PATIENT_IDENTIFIER
        .value(pid)
        .ok_or_else(|| MappingError::new("PID-3.1", "patient identifier is empty"))?;

    let mut ctx = Context {
        control_id,
        delimiters: message.delimiters(),
        used_ids: HashMap::new(),
    };

    let message_type = if trigger.is_empty() {
        code.to_string()
    } else {
        format!("{code}^{trigger}")
    };
    let mut bundle = Bundle::new(control_id, message_type);

    let patient = map_patient(&mut ctx, pid, nhs_raw)?;
    let patient_ref = Reference::to("Patient", patient.resource.id());
    bundle.entry.push(patient);

    match code {
        "ADT" => {
            match message.first("PV1") {
                Some(pv1) => bundle
                    .entry
                    .push(map_encounter(&mut ctx, pv1, trigger, &patient_ref)?),
                None => tracing::debug!(control_id, "ADT message without PV1; no encounter"),
            }
            for al1 in message.by_tag("AL1") {
                bundle.entry.push(map_allergy(&mut ctx, al1, &patient_ref)?);
            }
        }
        "ORU" => bundle
            .entry
            .extend(map_observations(&mut ctx, message, &patient_ref)?),
        other => tracing::debug!(control_id, message_code = other, "no routing beyond Patient"),
    }

    tracing::debug!(
        control_id,
        documents = bundle.entry.len(),
        "mapped message"
    );
    Ok(bundle)
}

// ============================================================================
// Shared helpers
// ============================================================================

struct Context<'a> {
    control_id: &'a str,
    delimiters: &'a Delimiters,
    /// Business ids already issued per resource type, for de-duplicating repeats.
    used_ids: HashMap<(ResourceType, String), usize>,
}

impl Context<'_> {
    /// Matching key for `business_id`; the second and later uses get a `#n` suffix.
    fn key(
        &mut self,
        resource_type: ResourceType,
        business_id: &str,
    ) -> Result<MatchingKey, MappingError> {
        let seen = self
            .used_ids
            .entry((resource_type, business_id.to_string()))
            .or_insert(0);
        *seen += 1;
        let business_id = if *seen == 1 {
            business_id.to_string()
        } else {
            format!("{business_id}#{seen}")
        };
        MatchingKey::new(self.control_id, resource_type, &business_id)
            .map_err(|e| MappingError::new("matchingKey", e.to_string()))
    }

    fn text(&self, raw: &str) -> String {
        self.delimiters.unescape(raw).into_owned()
    }

    /// Full text of a component, subcomponents re-joined with their separator.
    fn whole(&self, component: ComponentRef<'_>) -> String {
        let joined = match component {
            ComponentRef::Text(t) => t.to_string(),
            ComponentRef::Component(hl7::Component::Scalar(s)) => s.clone(),
            ComponentRef::Component(hl7::Component::Composite(parts)) => {
                parts.join(&self.delimiters.subcomponent.to_string())
            }
        };
        self.text(joined.trim())
    }

    fn document(
        &self,
        matching_key: MatchingKey,
        resource: Resource,
        notes: Notes,
    ) -> ClinicalDocument {
        ClinicalDocument {
            matching_key,
            source_message_id: self.control_id.to_string(),
            mapping_version: MAPPING_VERSION.to_string(),
            resource,
            annotations: notes.0,
        }
    }
}

#[derive(Clone, Default)]
struct Notes(Vec<Annotation>);

impl Notes {
    fn push(&mut self, kind: AnnotationKind, path: impl Into<String>, detail: impl Into<String>) {
        self.0.push(Annotation {
            kind,
            path: path.into(),
            detail: detail.into(),
        });
    }

    fn missing(&mut self, path: impl Into<String>, source: &FieldMapping) {
        self.push(
            AnnotationKind::MissingValue,
            path,
            format!("{} is empty", source.source()),
        );
    }

    fn unresolved(&mut self, path: impl Into<String>, source: &FieldMapping, value: &str) {
        self.push(
            AnnotationKind::CodingUnresolved,
            path,
            format!("{} value {value:?} is not a known code", source.source()),
        );
    }
}

/// Trimmed, non-empty text of a 1-based component in a repetition.
fn component<'a>(repetition: &'a Repetition, index: usize) -> Option<&'a str> {
    repetition
        .value(index)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Reads `YYYYMMDD` (extra precision is ignored).
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let digits = raw.get(..8)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
}

/// Reads `YYYYMMDD[HHMM[SS[.S+]]][+/-ZZZZ]`; timestamps without an offset are taken as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let (stamp, offset) = match raw.get(8..).and_then(|tail| tail.find(['+', '-'])) {
        Some(idx) => raw.split_at(8 + idx),
        None => (raw, ""),
    };
    let stamp = stamp.split('.').next().unwrap_or_default();
    if !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let naive = match stamp.len() {
        8 => NaiveDate::parse_from_str(stamp, "%Y%m%d")
            .ok()?
            .and_hms_opt(0, 0, 0)?,
        12 => NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M").ok()?,
        14 => NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?,
        _ => return None,
    };

    let offset = if offset.is_empty() {
        FixedOffset::east_opt(0)?
    } else {
        parse_offset(offset)?
    };
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_offset(raw: &str) -> Option<FixedOffset> {
    let (sign, digits) = match raw.split_at_checked(1)? {
        ("+", d) => (1, d),
        ("-", d) => (-1, d),
        _ => return None,
    };
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Keeps digits and `+`, dropping any extension after an `x`.
fn clean_phone(raw: &str) -> String {
    let base = raw.split(['x', 'X']).next().unwrap_or_default();
    base.chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect()
}

// ============================================================================
// Patient
// ============================================================================

fn map_patient(
    ctx: &mut Context<'_>,
    pid: &Segment,
    nhs_raw: &str,
) -> Result<ClinicalDocument, MappingError> {
    let key = ctx.key(ResourceType::Patient, nhs_raw)?;
    let mut notes = Notes::default();

    // Paired as declared; the checksum is verified by the auditor.
    let identifier = match NhsNumber::parse(nhs_raw) {
        Some(number) => number.to_string(),
        None => {
            notes.push(
                AnnotationKind::UnparseableValue,
                "identifier[0].value",
                format!("PID-3.1 value {nhs_raw:?} is not a ten digit NHS number"),
            );
            nhs_raw.to_string()
        }
    };

    let mut names = Vec::new();
    for repetition in table::PATIENT_NAME.repetitions(pid) {
        if repetition.is_empty() {
            continue;
        }
        let idx = names.len();
        let family = component(repetition, 1).map(|f| ctx.text(f));
        if family.is_none() {
            notes.push(
                AnnotationKind::MissingValue,
                format!("name[{idx}].family"),
                "PID-5.1 is empty",
            );
        }
        names.push(HumanName {
            use_type: Some(if idx == 0 {
                NameUse::Official
            } else {
                NameUse::Usual
            }),
            family,
            given: [2, 3]
                .iter()
                .filter_map(|&c| component(repetition, c))
                .map(|g| ctx.text(g))
                .collect(),
            suffix: component(repetition, 4).map(|s| ctx.text(s)).into_iter().collect(),
            prefix: component(repetition, 5).map(|p| ctx.text(p)).into_iter().collect(),
        });
    }
    if names.is_empty() {
        notes.missing("name", &table::PATIENT_NAME);
    }

    let birth_date = match table::PATIENT_BIRTH_DATE.value(pid) {
        None => {
            notes.missing("birthDate", &table::PATIENT_BIRTH_DATE);
            None
        }
        Some(raw) => {
            let parsed = parse_date(raw);
            if parsed.is_none() {
                notes.push(
                    AnnotationKind::UnparseableValue,
                    "birthDate",
                    format!("PID-7 value {raw:?} is not a YYYYMMDD date"),
                );
            }
            parsed
        }
    };

    let gender = match table::PATIENT_GENDER.value(pid) {
        None => {
            notes.missing("gender", &table::PATIENT_GENDER);
            None
        }
        Some(raw) => Some(match terms::gender(raw) {
            Some(g) => g.to_string(),
            None => {
                notes.unresolved("gender", &table::PATIENT_GENDER, raw);
                raw.to_string()
            }
        }),
    };

    let address = table::PATIENT_ADDRESS
        .repetitions(pid)
        .first()
        .and_then(|rep| map_address(ctx, rep))
        .into_iter()
        .collect();

    let telecom = table::PATIENT_TELECOM
        .repetitions(pid)
        .iter()
        .filter_map(|rep| component(rep, 1))
        .map(clean_phone)
        .filter(|phone| !phone.is_empty())
        .map(|value| ContactPoint {
            system: "phone".to_string(),
            value,
            use_type: Some("home".to_string()),
        })
        .collect();

    let patient = Patient {
        id: key.resource_id(),
        identifier: vec![Identifier {
            system: Some(NHS_NUMBER_SYSTEM.to_string()),
            value: identifier,
        }],
        name: names,
        gender,
        birth_date,
        telecom,
        address,
    };
    Ok(ctx.document(key, Resource::Patient(patient), notes))
}

/// A bare scalar is a postcode; otherwise `street^other^city^state^postcode`.
fn map_address(ctx: &Context<'_>, rep: &Repetition) -> Option<Address> {
    let address = match rep {
        Repetition::Scalar(raw) if raw.trim().is_empty() => return None,
        Repetition::Scalar(raw) => Address {
            postal_code: Some(ctx.text(raw.trim())),
            ..Address::default()
        },
        Repetition::Composite(_) => Address {
            line: [1, 2]
                .iter()
                .filter_map(|&c| component(rep, c))
                .map(|l| ctx.text(l))
                .collect(),
            city: component(rep, 3).map(|c| ctx.text(c)),
            postal_code: component(rep, 5).map(|p| ctx.text(p)),
        },
    };
    (address != Address::default()).then_some(address)
}

// ============================================================================
// Encounter
// ============================================================================

fn map_encounter(
    ctx: &mut Context<'_>,
    pv1: &Segment,
    trigger: &str,
    patient_ref: &Reference,
) -> Result<ClinicalDocument, MappingError> {
    let business_id = table::ENCOUNTER_SET_ID.value(pv1).unwrap_or("1");
    let key = ctx.key(ResourceType::Encounter, business_id)?;
    let mut notes = Notes::default();

    let status = match terms::encounter_status(trigger) {
        Some(s) => s.to_string(),
        None => {
            notes.unresolved("status", &table::MESSAGE_TYPE, trigger);
            "unknown".to_string()
        }
    };

    let class = match table::ENCOUNTER_CLASS.value(pv1) {
        None => {
            notes.missing("class", &table::ENCOUNTER_CLASS);
            None
        }
        Some(raw) => Some(terms::patient_class(raw).unwrap_or_else(|| {
            notes.unresolved("class", &table::ENCOUNTER_CLASS, raw);
            Coding {
                code: Some(raw.to_string()),
                ..Coding::default()
            }
        })),
    };

    let location = table::ENCOUNTER_LOCATION
        .repetitions(pv1)
        .first()
        .map(|rep| {
            (1..=rep.len())
                .filter_map(|c| rep.component(c))
                .map(|c| ctx.whole(c))
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        })
        .filter(|display| !display.is_empty())
        .map(|display| EncounterLocation {
            location: Reference::display(display),
        })
        .into_iter()
        .collect();

    let participant = table::ENCOUNTER_ATTENDING
        .repetitions(pv1)
        .iter()
        .filter(|rep| !rep.is_empty())
        .map(|rep| {
            let name: Vec<String> = (2..=6)
                .filter_map(|c| component(rep, c))
                .map(|p| ctx.text(p))
                .collect();
            EncounterParticipant {
                individual: Reference {
                    reference: component(rep, 1).map(|id| format!("Practitioner/{id}")),
                    display: (!name.is_empty()).then(|| name.join(" ")),
                },
            }
        })
        .collect();

    let encounter = Encounter {
        id: key.resource_id(),
        status,
        class,
        subject: Some(patient_ref.clone()),
        location,
        participant,
    };
    Ok(ctx.document(key, Resource::Encounter(encounter), notes))
}

// ============================================================================
// AllergyIntolerance
// ============================================================================

fn map_allergy(
    ctx: &mut Context<'_>,
    al1: &Segment,
    patient_ref: &Reference,
) -> Result<ClinicalDocument, MappingError> {
    let business_id = table::ALLERGY_SET_ID.value(al1).unwrap_or("1");
    let key = ctx.key(ResourceType::AllergyIntolerance, business_id)?;
    let mut notes = Notes::default();

    let category = match table::ALLERGY_TYPE.value(al1) {
        None => {
            notes.missing("category", &table::ALLERGY_TYPE);
            Vec::new()
        }
        Some(raw) => match terms::allergy_category(raw) {
            Some(c) => vec![c.to_string()],
            None => {
                notes.unresolved("category", &table::ALLERGY_TYPE, raw);
                Vec::new()
            }
        },
    };

    let code = map_allergen(ctx, al1, &mut notes);

    let (criticality, severity) = match table::ALLERGY_SEVERITY.value(al1) {
        None => {
            notes.missing("reaction[0].severity", &table::ALLERGY_SEVERITY);
            (None, None)
        }
        Some(raw) => match terms::allergy_severity(raw) {
            Some((crit, sev)) => (Some(crit.to_string()), Some(sev.to_string())),
            None => {
                notes.unresolved("reaction[0].severity", &table::ALLERGY_SEVERITY, raw);
                (None, Some(raw.to_string()))
            }
        },
    };

    let manifestation: Vec<CodeableConcept> = table::ALLERGY_REACTION
        .repetitions(al1)
        .iter()
        .filter_map(|rep| component(rep, 1))
        .map(|text| CodeableConcept::from_text(ctx.text(text)))
        .collect();
    let reaction = if manifestation.is_empty() && severity.is_none() {
        Vec::new()
    } else {
        vec![AllergyReaction {
            manifestation,
            severity,
        }]
    };

    let allergy = AllergyIntolerance {
        id: key.resource_id(),
        clinical_status: CodeableConcept::from_coding(Coding {
            system: Some(terms::ALLERGY_CLINICAL_SYSTEM.to_string()),
            code: Some("active".to_string()),
            display: None,
        }),
        verification_status: CodeableConcept::from_coding(Coding {
            system: Some(terms::ALLERGY_VERIFICATION_SYSTEM.to_string()),
            code: Some("confirmed".to_string()),
            display: None,
        }),
        allergy_type: Some("allergy".to_string()),
        category,
        criticality,
        code,
        patient: Some(patient_ref.clone()),
        reaction,
    };
    Ok(ctx.document(key, Resource::AllergyIntolerance(allergy), notes))
}

/// `AL1-3` is `code^text^system`.
fn map_allergen(ctx: &Context<'_>, al1: &Segment, notes: &mut Notes) -> Option<CodeableConcept> {
    let rep = table::ALLERGY_CODE.repetitions(al1).first()?;
    let Some(code) = component(rep, 1) else {
        notes.missing("code", &table::ALLERGY_CODE);
        return None;
    };
    let source_text = component(rep, 2).map(|t| ctx.text(t));

    let system = component(rep, 3).map(|suffix| match terms::coding_system(suffix) {
        Some(url) => url.to_string(),
        None => {
            notes.unresolved("code.coding[0].system", &table::ALLERGY_CODE, suffix);
            suffix.to_string()
        }
    });
    let display = match terms::allergen(code) {
        Some(d) => Some(d.to_string()),
        None => {
            notes.unresolved("code.coding[0].code", &table::ALLERGY_CODE, code);
            source_text.clone()
        }
    };

    Some(CodeableConcept {
        coding: vec![Coding {
            system,
            code: Some(code.to_string()),
            display,
        }],
        text: source_text,
    })
}

// ============================================================================
// Observations
// ============================================================================

/// A blood-pressure measurement waiting to be grouped into its panel.
struct PanelPart {
    component: ObservationComponent,
    notes: Vec<(AnnotationKind, String, String)>,
}

/// Panel fields shared by every reading of one order.
#[derive(Clone)]
struct PanelHeader {
    status: String,
    effective: Option<DateTime<Utc>>,
    notes: Notes,
}

/// Blood-pressure parts of one `OBR` group. The n-th systolic pairs with the n-th diastolic.
struct PendingPanels {
    /// Position in the output where the panels are inserted.
    slot: usize,
    header: PanelHeader,
    systolic: Vec<PanelPart>,
    diastolic: Vec<PanelPart>,
}

fn map_observations(
    ctx: &mut Context<'_>,
    message: &Message,
    patient_ref: &Reference,
) -> Result<Vec<ClinicalDocument>, MappingError> {
    let mut documents = Vec::new();
    let mut order: Option<&Segment> = None;
    let mut panels: Option<PendingPanels> = None;

    for obx in message.segments() {
        if obx.tag == "OBR" {
            if let Some(pending) = panels.take() {
                flush_panels(ctx, pending, patient_ref, &mut documents)?;
            }
            order = Some(obx);
            continue;
        }
        if obx.tag != "OBX" {
            continue;
        }
        let code_rep = table::OBSERVATION_CODE.repetitions(obx).first();
        let code = code_rep.and_then(|rep| component(rep, 1));

        match code {
            Some(c @ (terms::SYSTOLIC_BP | terms::DIASTOLIC_BP)) => {
                let pending = panels.get_or_insert_with(|| {
                    let mut notes = Notes::default();
                    let effective = effective_time(order, &mut notes);
                    PendingPanels {
                        slot: documents.len(),
                        header: PanelHeader {
                            status: observation_status(obx, &mut notes),
                            effective,
                            notes,
                        },
                        systolic: Vec::new(),
                        diastolic: Vec::new(),
                    }
                });
                let mut part_notes = Notes::default();
                let value_quantity = quantity(ctx, obx, &mut part_notes, "valueQuantity");
                let part = PanelPart {
                    component: ObservationComponent {
                        code: CodeableConcept::from_coding(
                            terms::vital_sign(c).unwrap_or_default(),
                        ),
                        value_quantity,
                    },
                    notes: part_notes
                        .0
                        .into_iter()
                        .map(|a| (a.kind, a.path, a.detail))
                        .collect(),
                };
                if c == terms::SYSTOLIC_BP {
                    pending.systolic.push(part);
                } else {
                    pending.diastolic.push(part);
                }
            }
            _ => {
                let doc = map_single_observation(ctx, obx, code_rep, code, order, patient_ref)?;
                documents.push(doc);
            }
        }
    }

    if let Some(pending) = panels {
        flush_panels(ctx, pending, patient_ref, &mut documents)?;
    }
    Ok(documents)
}

/// Build one panel per systolic/diastolic pair and insert them where the group began.
fn flush_panels(
    ctx: &mut Context<'_>,
    pending: PendingPanels,
    patient_ref: &Reference,
    documents: &mut Vec<ClinicalDocument>,
) -> Result<(), MappingError> {
    let mut systolic = pending.systolic.into_iter();
    let mut diastolic = pending.diastolic.into_iter();
    let mut slot = pending.slot;
    loop {
        let (sys, dia) = (systolic.next(), diastolic.next());
        if sys.is_none() && dia.is_none() {
            return Ok(());
        }
        let doc = build_panel(ctx, pending.header.clone(), sys, dia, patient_ref)?;
        documents.insert(slot, doc);
        slot += 1;
    }
}

fn map_single_observation(
    ctx: &mut Context<'_>,
    obx: &Segment,
    code_rep: Option<&Repetition>,
    code: Option<&str>,
    order: Option<&Segment>,
    patient_ref: &Reference,
) -> Result<ClinicalDocument, MappingError> {
    let mut notes = Notes::default();

    let (business_id, concept) = match code {
        None => {
            notes.missing("code", &table::OBSERVATION_CODE);
            let set_id = obx.non_empty(1, 1).unwrap_or("1");
            (format!("OBX-{set_id}"), CodeableConcept::default())
        }
        Some(c) => {
            let concept = match terms::vital_sign(c) {
                Some(coding) => CodeableConcept::from_coding(coding),
                None => {
                    notes.unresolved("code.coding[0].code", &table::OBSERVATION_CODE, c);
                    let system = code_rep.and_then(|rep| component(rep, 3)).map(|s| {
                        terms::coding_system(s).map_or_else(|| s.to_string(), str::to_string)
                    });
                    let display = code_rep
                        .and_then(|rep| component(rep, 2))
                        .map(|d| ctx.text(d));
                    CodeableConcept {
                        coding: vec![Coding {
                            system,
                            code: Some(c.to_string()),
                            display: display.clone(),
                        }],
                        text: display,
                    }
                }
            };
            (c.to_string(), concept)
        }
    };

    let key = ctx.key(ResourceType::Observation, &business_id)?;
    let status = observation_status(obx, &mut notes);
    let effective_date_time = effective_time(order, &mut notes);
    let value_quantity = quantity(ctx, obx, &mut notes, "valueQuantity");

    let observation = Observation {
        id: key.resource_id(),
        status,
        code: concept,
        subject: Some(patient_ref.clone()),
        effective_date_time,
        value_quantity,
        component: Vec::new(),
    };
    Ok(ctx.document(key, Resource::Observation(observation), notes))
}

fn build_panel(
    ctx: &mut Context<'_>,
    header: PanelHeader,
    systolic: Option<PanelPart>,
    diastolic: Option<PanelPart>,
    patient_ref: &Reference,
) -> Result<ClinicalDocument, MappingError> {
    let key = ctx.key(ResourceType::Observation, terms::BLOOD_PRESSURE_PANEL)?;
    let mut notes = header.notes;
    let mut component = Vec::new();

    for (label, part) in [("systolic", systolic), ("diastolic", diastolic)] {
        match part {
            Some(part) => {
                let idx = component.len();
                for (kind, path, detail) in part.notes {
                    notes.push(kind, format!("component[{idx}].{path}"), detail);
                }
                component.push(part.component);
            }
            None => notes.push(
                AnnotationKind::MissingValue,
                "component",
                format!("no {label} OBX for this reading"),
            ),
        }
    }

    let observation = Observation {
        id: key.resource_id(),
        status: header.status,
        code: CodeableConcept::from_coding(
            terms::vital_sign(terms::BLOOD_PRESSURE_PANEL).unwrap_or_default(),
        ),
        subject: Some(patient_ref.clone()),
        effective_date_time: header.effective,
        value_quantity: None,
        component,
    };
    Ok(ctx.document(key, Resource::Observation(observation), notes))
}

fn observation_status(obx: &Segment, notes: &mut Notes) -> String {
    match table::OBSERVATION_STATUS.value(obx) {
        None => {
            notes.missing("status", &table::OBSERVATION_STATUS);
            "unknown".to_string()
        }
        Some(raw) => match terms::observation_status(raw) {
            Some(s) => s.to_string(),
            None => {
                notes.unresolved("status", &table::OBSERVATION_STATUS, raw);
                raw.to_string()
            }
        },
    }
}

/// `OBR-7` of the order the observation belongs to.
fn effective_time(order: Option<&Segment>, notes: &mut Notes) -> Option<DateTime<Utc>> {
    let Some(raw) = order.and_then(|obr| table::OBSERVATION_EFFECTIVE.value(obr)) else {
        notes.missing("effectiveDateTime", &table::OBSERVATION_EFFECTIVE);
        return None;
    };
    let parsed = parse_timestamp(raw);
    if parsed.is_none() {
        notes.push(
            AnnotationKind::UnparseableValue,
            "effectiveDateTime",
            format!("OBR-7 value {raw:?} is not a timestamp"),
        );
    }
    parsed
}

/// `OBX-5` value with `OBX-6` unit. `None` only when both are absent.
fn quantity(ctx: &Context<'_>, obx: &Segment, notes: &mut Notes, path: &str) -> Option<Quantity> {
    let value = match table::OBSERVATION_VALUE.value(obx) {
        None => {
            notes.missing(format!("{path}.value"), &table::OBSERVATION_VALUE);
            None
        }
        Some(raw) => {
            let parsed = raw.parse::<f64>().ok().filter(|v| v.is_finite());
            if parsed.is_none() {
                notes.push(
                    AnnotationKind::UnparseableValue,
                    format!("{path}.value"),
                    format!("OBX-5 value {raw:?} is not a number"),
                );
            }
            parsed
        }
    };

    let unit = table::OBSERVATION_UNIT.value(obx);
    if value.is_none() && unit.is_none() {
        return None;
    }

    let mut quantity = Quantity {
        value,
        ..Quantity::default()
    };
    match unit {
        None => notes.missing(format!("{path}.unit"), &table::OBSERVATION_UNIT),
        Some(raw) => match terms::unit(raw) {
            Some((display, ucum)) => {
                quantity.unit = Some(display.to_string());
                quantity.system = Some(terms::UCUM_SYSTEM.to_string());
                quantity.code = Some(ucum.to_string());
            }
            None => {
                notes.unresolved(format!("{path}.unit"), &table::OBSERVATION_UNIT, raw);
                quantity.unit = Some(ctx.text(raw));
                quantity.code = Some(raw.to_string());
            }
        },
    }
    Some(quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{adt_message, hr_message, ADT_A01, ORU_BP, ORU_HR};

    fn map(text: &str) -> Bundle {
        map_message(&hl7::parse(text).expect("parse")).expect("map")
    }

    fn kinds(doc: &ClinicalDocument) -> Vec<(AnnotationKind, &str)> {
        doc.annotations
            .iter()
            .map(|a| (a.kind, a.path.as_str()))
            .collect()
    }

    #[test]
    fn maps_patient_demographics() {
        let bundle = map(ORU_HR);
        assert_eq!(bundle.message_id, "482913");
        assert_eq!(bundle.message_type, "ORU^R01");

        let doc = &bundle.entry[0];
        assert_eq!(doc.matching_key.as_str(), "482913/Patient/9434767067");
        assert_eq!(doc.mapping_version, MAPPING_VERSION);
        let patient = doc.as_patient().expect("patient");
        assert_eq!(patient.id, doc.matching_key.resource_id());
        assert_eq!(
            patient.nhs_number().map(|i| i.value.as_str()),
            Some("9434767067")
        );
        let name = patient.primary_name().expect("name");
        assert_eq!(name.family.as_deref(), Some("SMITH"));
        assert_eq!(name.given, vec!["John"]);
        assert_eq!(name.use_type, Some(NameUse::Official));
        assert_eq!(patient.gender.as_deref(), Some("male"));
        assert_eq!(patient.birth_date, NaiveDate::from_ymd_opt(1980, 1, 1));
        assert_eq!(patient.address[0].postal_code.as_deref(), Some("LS1 4AP"));
        assert_eq!(patient.telecom[0].value, "01134960000");
        assert!(doc.annotations.is_empty(), "{:?}", doc.annotations);
    }

    #[test]
    fn maps_heart_rate_observation() {
        let bundle = map(ORU_HR);
        assert_eq!(bundle.entry.len(), 2);
        let doc = &bundle.entry[1];
        assert_eq!(doc.matching_key.as_str(), "482913/Observation/8867-4");
        let obs = doc.as_observation().expect("observation");
        assert!(obs.has_code(terms::HEART_RATE));
        assert_eq!(obs.status, "final");
        assert_eq!(obs.value(), Some(72.0));
        let q = obs.value_quantity.as_ref().expect("quantity");
        assert_eq!(q.unit.as_deref(), Some("beats/minute"));
        assert_eq!(q.code.as_deref(), Some("/min"));
        assert_eq!(
            obs.effective_date_time,
            "2024-01-05T09:30:00Z".parse::<DateTime<Utc>>().ok()
        );
        assert_eq!(
            obs.subject.as_ref().and_then(|s| s.reference.as_deref()),
            Some(format!("Patient/{}", bundle.entry[0].resource.id()).as_str())
        );
        assert!(doc.annotations.is_empty(), "{:?}", doc.annotations);
    }

    #[test]
    fn groups_blood_pressure_into_one_panel() {
        let bundle = map(ORU_BP);
        assert_eq!(bundle.entry.len(), 2);
        let doc = &bundle.entry[1];
        assert_eq!(doc.matching_key.as_str(), "771001/Observation/85354-9");
        let obs = doc.as_observation().expect("observation");
        assert!(obs.has_code(terms::BLOOD_PRESSURE_PANEL));
        assert!(obs.value_quantity.is_none());
        assert_eq!(obs.component.len(), 2);
        assert_eq!(obs.component(terms::SYSTOLIC_BP).and_then(|c| c.value()), Some(128.0));
        assert_eq!(obs.component(terms::DIASTOLIC_BP).and_then(|c| c.value()), Some(84.0));
        assert_eq!(obs.component(terms::DIASTOLIC_BP).and_then(|c| c.unit()), Some("mmHg"));
    }

    #[test]
    fn half_a_blood_pressure_still_yields_a_panel() {
        let text = ORU_BP
            .lines()
            .filter(|l| !l.contains("8462-4"))
            .collect::<Vec<_>>()
            .join("\n");
        let bundle = map(&text);
        let doc = &bundle.entry[1];
        assert_eq!(doc.as_observation().map(|o| o.component.len()), Some(1));
        assert!(kinds(doc).contains(&(AnnotationKind::MissingValue, "component")));
    }

    #[test]
    fn repeated_blood_pressure_readings_each_get_a_panel() {
        let text = format!(
            "{ORU_BP}\n\
             OBX|3|NM|8480-6^SYSTOLIC BP^LN||141|mm[Hg]|||||F\n\
             OBX|4|NM|8462-4^DIASTOLIC BP^LN||92|mm[Hg]|||||F"
        );
        let bundle = map(&text);
        let keys: Vec<_> = bundle.entry.iter().map(|d| d.matching_key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "771001/Patient/9434767067",
                "771001/Observation/85354-9",
                "771001/Observation/85354-9#2"
            ]
        );

        let values = |idx: usize| {
            let obs = bundle.entry[idx].as_observation().expect("observation");
            (
                obs.component(terms::SYSTOLIC_BP).and_then(|c| c.value()),
                obs.component(terms::DIASTOLIC_BP).and_then(|c| c.value()),
            )
        };
        assert_eq!(values(1), (Some(128.0), Some(84.0)));
        assert_eq!(values(2), (Some(141.0), Some(92.0)));
        assert!(bundle.entry[2].annotations.is_empty(), "{:?}", bundle.entry[2].annotations);
    }

    #[test]
    fn unpaired_extra_systolic_is_kept_in_its_own_panel() {
        let text = format!("{ORU_BP}\nOBX|3|NM|8480-6^SYSTOLIC BP^LN||141|mm[Hg]|||||F");
        let bundle = map(&text);
        assert_eq!(bundle.entry.len(), 3);
        let extra = &bundle.entry[2];
        assert_eq!(extra.matching_key.as_str(), "771001/Observation/85354-9#2");
        let obs = extra.as_observation().expect("observation");
        assert_eq!(obs.component(terms::SYSTOLIC_BP).and_then(|c| c.value()), Some(141.0));
        assert!(obs.component(terms::DIASTOLIC_BP).is_none());
        assert!(kinds(extra).contains(&(AnnotationKind::MissingValue, "component")));
    }

    #[test]
    fn each_order_groups_its_own_blood_pressure() {
        let text = format!(
            "{ORU_BP}\n\
             OBR|2|||VITALS^Vital signs|||202401051130\n\
             OBX|3|NM|8480-6^SYSTOLIC BP^LN||118|mm[Hg]|||||F\n\
             OBX|4|NM|8462-4^DIASTOLIC BP^LN||76|mm[Hg]|||||F"
        );
        let bundle = map(&text);
        assert_eq!(bundle.entry.len(), 3);
        let effective = |idx: usize| {
            bundle.entry[idx]
                .as_observation()
                .and_then(|o| o.effective_date_time)
        };
        assert_eq!(effective(1), "2024-01-05T10:15:00Z".parse::<DateTime<Utc>>().ok());
        assert_eq!(effective(2), "2024-01-05T11:30:00Z".parse::<DateTime<Utc>>().ok());
    }

    #[test]
    fn maps_admission_with_encounter_and_allergy() {
        let bundle = map(ADT_A01);
        let types: Vec<ResourceType> = bundle.entry.iter().map(|d| d.resource_type()).collect();
        assert_eq!(
            types,
            vec![
                ResourceType::Patient,
                ResourceType::Encounter,
                ResourceType::AllergyIntolerance
            ]
        );

        let encounter = bundle.entry[1].as_encounter().expect("encounter");
        assert_eq!(encounter.status, "in-progress");
        assert_eq!(
            encounter.class.as_ref().and_then(|c| c.code.as_deref()),
            Some("IMP")
        );
        assert_eq!(
            encounter.location[0].location.display.as_deref(),
            Some("A&E-12-3")
        );
        assert_eq!(
            encounter.participant[0].individual.reference.as_deref(),
            Some("Practitioner/123")
        );
        assert!(encounter.subject.is_some());

        let allergy = bundle.entry[2].as_allergy().expect("allergy");
        assert_eq!(bundle.entry[2].matching_key.as_str(), "553201/AllergyIntolerance/1");
        assert_eq!(allergy.category, vec!["medication"]);
        assert_eq!(allergy.criticality.as_deref(), Some("high"));
        let coding = &allergy.code.as_ref().expect("code").coding[0];
        assert_eq!(coding.code.as_deref(), Some("Z88.0"));
        assert_eq!(coding.system.as_deref(), Some(terms::ICD10_SYSTEM));
        assert_eq!(allergy.reaction[0].severity.as_deref(), Some("severe"));
        let manifestations: Vec<_> = allergy.reaction[0]
            .manifestation
            .iter()
            .filter_map(|m| m.text.as_deref())
            .collect();
        assert_eq!(manifestations, vec!["Anaphylaxis", "Hives"]);
        assert!(allergy.has_patient_link());
    }

    #[test]
    fn discharge_finishes_the_encounter() {
        let bundle = map(&adt_message("A03", "9434767067"));
        assert_eq!(bundle.entry[1].as_encounter().map(|e| e.status.as_str()), Some("finished"));
    }

    #[test]
    fn unknown_codes_pass_through_with_annotation() {
        let text = ADT_A01
            .replace("|M|||", "|Q|||")
            .replace("|I|A\\T\\E", "|Z|A\\T\\E")
            .replace("Z88.0^PENICILLIN^CD", "T78.4^LATEX GLOVES^SNM");
        let bundle = map(&text);

        let patient = &bundle.entry[0];
        assert_eq!(patient.as_patient().and_then(|p| p.gender.as_deref()), Some("Q"));
        assert!(kinds(patient).contains(&(AnnotationKind::CodingUnresolved, "gender")));

        let encounter = &bundle.entry[1];
        assert_eq!(
            encounter.as_encounter().and_then(|e| e.class.as_ref()?.code.as_deref()),
            Some("Z")
        );
        assert!(kinds(encounter).contains(&(AnnotationKind::CodingUnresolved, "class")));

        let allergy = &bundle.entry[2];
        let coding = &allergy.as_allergy().and_then(|a| a.code.clone()).expect("code").coding[0];
        assert_eq!(coding.code.as_deref(), Some("T78.4"));
        assert_eq!(coding.system.as_deref(), Some("SNM"));
        assert_eq!(coding.display.as_deref(), Some("LATEX GLOVES"));
        let k = kinds(allergy);
        assert!(k.contains(&(AnnotationKind::CodingUnresolved, "code.coding[0].code")));
        assert!(k.contains(&(AnnotationKind::CodingUnresolved, "code.coding[0].system")));
    }

    #[test]
    fn gaps_degrade_to_annotations() {
        let text = ORU_HR
            .replace("SMITH^John^^^MR", "^John")
            .replace("||19800101|M|", "||1980-01-01||")
            .replace("||72|/min|", "||fast|/min|");
        let bundle = map(&text);

        let patient = bundle.entry[0].as_patient().expect("patient");
        assert_eq!(patient.primary_name().and_then(|n| n.family.as_deref()), None);
        assert_eq!(patient.birth_date, None);
        assert_eq!(patient.gender, None);
        let k = kinds(&bundle.entry[0]);
        assert!(k.contains(&(AnnotationKind::MissingValue, "name[0].family")));
        assert!(k.contains(&(AnnotationKind::UnparseableValue, "birthDate")));
        assert!(k.contains(&(AnnotationKind::MissingValue, "gender")));

        let obs = bundle.entry[1].as_observation().expect("observation");
        assert_eq!(obs.value(), None);
        assert_eq!(
            obs.value_quantity.as_ref().and_then(|q| q.unit.as_deref()),
            Some("beats/minute")
        );
        assert!(kinds(&bundle.entry[1])
            .contains(&(AnnotationKind::UnparseableValue, "valueQuantity.value")));
    }

    #[test]
    fn preserves_name_and_phone_repetition_order() {
        let text = ORU_HR
            .replace("SMITH^John^^^MR", "SMITH^John~SMYTHE^Jon^^^MR")
            .replace("|0113 496 0000", "|0113 496 0000~+44 7700 900123 x12");
        let patient = map(&text).entry[0].as_patient().cloned().expect("patient");
        let families: Vec<_> = patient.name.iter().filter_map(|n| n.family.as_deref()).collect();
        assert_eq!(families, vec!["SMITH", "SMYTHE"]);
        assert_eq!(patient.name[1].use_type, Some(NameUse::Usual));
        assert_eq!(patient.name[1].prefix, vec!["MR"]);
        let phones: Vec<_> = patient.telecom.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(phones, vec!["01134960000", "+447700900123"]);
    }

    #[test]
    fn identity_failures_are_mapping_errors() {
        let no_pid = "MSH|^~\\&|A|B|C|D|1||ORU^R01|9|P|2.3\nOBX|1|NM|8867-4^HR^LN||72|/min";
        let err = map_message(&hl7::parse(no_pid).expect("parse")).expect_err("no PID");
        assert_eq!(err.field, "PID");

        let err = map_message(&hl7::parse(&hr_message("482913", "", "72")).expect("parse"))
            .expect_err("empty identifier");
        assert_eq!(err.field, "PID-3.1");

        let err = map_message(&hl7::parse(&hr_message("", "9434767067", "72")).expect("parse"))
            .expect_err("empty control id");
        assert_eq!(err.field, "MSH-10");
    }

    #[test]
    fn carries_malformed_identifiers_verbatim() {
        let bundle = map(&hr_message("1", "94347670", "72"));
        let patient = &bundle.entry[0];
        assert_eq!(
            patient.as_patient().and_then(|p| p.nhs_number()).map(|i| i.value.as_str()),
            Some("94347670")
        );
        assert!(kinds(patient).contains(&(AnnotationKind::UnparseableValue, "identifier[0].value")));
    }

    #[test]
    fn mapping_is_deterministic() {
        let message = hl7::parse(ADT_A01).expect("parse");
        let first = map_message(&message).expect("map");
        let second = map_message(&message).expect("map");
        assert_eq!(first, second);
        assert_eq!(
            first.render().expect("render"),
            second.render().expect("render")
        );
    }

    #[test]
    fn matching_key_ignores_translated_content() {
        let a = map(&adt_message("A01", "9434767067"));
        let b = map(&adt_message("A08", "9434767067").replace("|M|||", "|X|||"));
        let keys = |bundle: &Bundle| -> Vec<String> {
            bundle.entry.iter().map(|d| d.matching_key.to_string()).collect()
        };
        assert_eq!(keys(&a), keys(&b));
    }

    #[test]
    fn repeated_business_ids_get_distinct_keys() {
        let text = format!("{ORU_HR}\nOBX|2|NM|8867-4^HEART RATE^LN||75|/min|||||F");
        let bundle = map(&text);
        let keys: Vec<_> = bundle.entry.iter().map(|d| d.matching_key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "482913/Patient/9434767067",
                "482913/Observation/8867-4",
                "482913/Observation/8867-4#2"
            ]
        );
    }

    #[test]
    fn unknown_observation_codes_stand_alone() {
        let text = format!("{ORU_HR}\nOBX|2|NM|2708-6^SPO2^LN||97|%|||||F");
        let bundle = map(&text);
        let doc = &bundle.entry[2];
        assert_eq!(doc.matching_key.as_str(), "482913/Observation/2708-6");
        let obs = doc.as_observation().expect("observation");
        assert_eq!(obs.code.coding[0].system.as_deref(), Some(terms::LOINC_SYSTEM));
        let k = kinds(doc);
        assert!(k.contains(&(AnnotationKind::CodingUnresolved, "code.coding[0].code")));
        assert!(k.contains(&(AnnotationKind::CodingUnresolved, "valueQuantity.unit")));
    }

    #[test]
    fn parses_legacy_timestamps() {
        let utc = |s: &str| s.parse::<DateTime<Utc>>().ok();
        assert_eq!(parse_timestamp("20240105"), utc("2024-01-05T00:00:00Z"));
        assert_eq!(parse_timestamp("202401050930"), utc("2024-01-05T09:30:00Z"));
        assert_eq!(parse_timestamp("20240105093015"), utc("2024-01-05T09:30:15Z"));
        assert_eq!(parse_timestamp("20240105093015.123"), utc("2024-01-05T09:30:15Z"));
        assert_eq!(parse_timestamp("20240105093000+0100"), utc("2024-01-05T08:30:00Z"));
        assert_eq!(parse_timestamp("20240105093000-0500"), utc("2024-01-05T14:30:00Z"));
        assert_eq!(parse_timestamp("2024010"), None);
        assert_eq!(parse_timestamp("20241305"), None);
        assert_eq!(parse_timestamp("2024-01-05"), None);
        assert_eq!(parse_timestamp("20240105093000+01"), None);
    }
}
