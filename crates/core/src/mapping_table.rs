//! Versioned source → destination mapping table.
//!
//! Every positional source value the mapper reads is declared here, paired with the document
//! path it lands in. Bumping [`MAPPING_VERSION`] is required whenever an entry changes, because
//! the version is stamped on every document produced.

use hl7::{Repetition, Segment};

pub const MAPPING_VERSION: &str = "hl7v2.3-fhir-r4/1";

/// One `(segment, field, component) → destination` entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldMapping {
    pub segment: &'static str,
    pub field: usize,
    /// `None` when the destination takes the whole field (all components).
    pub component: Option<usize>,
    pub destination: &'static str,
    /// Repetitions map to a list-valued destination, in order.
    pub repeated: bool,
}

impl FieldMapping {
    const fn scalar(segment: &'static str, field: usize, destination: &'static str) -> Self {
        Self {
            segment,
            field,
            component: Some(1),
            destination,
            repeated: false,
        }
    }

    const fn composite(segment: &'static str, field: usize, destination: &'static str) -> Self {
        Self {
            segment,
            field,
            component: None,
            destination,
            repeated: false,
        }
    }

    const fn repeated(segment: &'static str, field: usize, destination: &'static str) -> Self {
        Self {
            segment,
            field,
            component: None,
            destination,
            repeated: true,
        }
    }

    /// Legacy address of the source, e.g. `PID-3.1` or `PID-5`.
    pub fn source(&self) -> String {
        match self.component {
            Some(c) => format!("{}-{}.{}", self.segment, self.field, c),
            None => format!("{}-{}", self.segment, self.field),
        }
    }

    /// Trimmed, non-empty text of the mapped component in the first repetition.
    pub fn value<'a>(&self, segment: &'a Segment) -> Option<&'a str> {
        debug_assert_eq!(segment.tag, self.segment);
        segment.non_empty(self.field, self.component.unwrap_or(1))
    }

    /// Every repetition of the mapped field; empty when the field is absent.
    pub fn repetitions<'a>(&self, segment: &'a Segment) -> &'a [Repetition] {
        debug_assert_eq!(segment.tag, self.segment);
        segment
            .field(self.field)
            .map(|f| f.repetitions())
            .unwrap_or_default()
    }
}

pub const MESSAGE_TYPE: FieldMapping = FieldMapping::composite("MSH", 9, "bundle.messageType");
pub const MESSAGE_CONTROL_ID: FieldMapping =
    FieldMapping::scalar("MSH", 10, "document.sourceMessageId");

pub const PATIENT_IDENTIFIER: FieldMapping =
    FieldMapping::scalar("PID", 3, "Patient.identifier[0].value");
pub const PATIENT_NAME: FieldMapping = FieldMapping::repeated("PID", 5, "Patient.name[]");
pub const PATIENT_BIRTH_DATE: FieldMapping = FieldMapping::scalar("PID", 7, "Patient.birthDate");
pub const PATIENT_GENDER: FieldMapping = FieldMapping::scalar("PID", 8, "Patient.gender");
pub const PATIENT_ADDRESS: FieldMapping =
    FieldMapping::composite("PID", 11, "Patient.address[0]");
pub const PATIENT_TELECOM: FieldMapping = FieldMapping::repeated("PID", 13, "Patient.telecom[]");

pub const ENCOUNTER_SET_ID: FieldMapping = FieldMapping::scalar("PV1", 1, "matchingKey");
pub const ENCOUNTER_CLASS: FieldMapping = FieldMapping::scalar("PV1", 2, "Encounter.class");
pub const ENCOUNTER_LOCATION: FieldMapping =
    FieldMapping::composite("PV1", 3, "Encounter.location[0].location.display");
pub const ENCOUNTER_ATTENDING: FieldMapping =
    FieldMapping::composite("PV1", 7, "Encounter.participant[0].individual");

pub const OBSERVATION_EFFECTIVE: FieldMapping =
    FieldMapping::scalar("OBR", 7, "Observation.effectiveDateTime");
pub const OBSERVATION_CODE: FieldMapping =
    FieldMapping::composite("OBX", 3, "Observation.code.coding[0]");
pub const OBSERVATION_VALUE: FieldMapping =
    FieldMapping::scalar("OBX", 5, "Observation.valueQuantity.value");
pub const OBSERVATION_UNIT: FieldMapping =
    FieldMapping::scalar("OBX", 6, "Observation.valueQuantity.unit");
pub const OBSERVATION_STATUS: FieldMapping =
    FieldMapping::scalar("OBX", 11, "Observation.status");

pub const ALLERGY_SET_ID: FieldMapping = FieldMapping::scalar("AL1", 1, "matchingKey");
pub const ALLERGY_TYPE: FieldMapping =
    FieldMapping::scalar("AL1", 2, "AllergyIntolerance.category[0]");
pub const ALLERGY_CODE: FieldMapping =
    FieldMapping::composite("AL1", 3, "AllergyIntolerance.code.coding[0]");
pub const ALLERGY_SEVERITY: FieldMapping =
    FieldMapping::scalar("AL1", 4, "AllergyIntolerance.reaction[0].severity");
pub const ALLERGY_REACTION: FieldMapping =
    FieldMapping::repeated("AL1", 5, "AllergyIntolerance.reaction[0].manifestation[]");

/// The full table, in segment order.
pub const TABLE: &[FieldMapping] = &[
    MESSAGE_TYPE,
    MESSAGE_CONTROL_ID,
    PATIENT_IDENTIFIER,
    PATIENT_NAME,
    PATIENT_BIRTH_DATE,
    PATIENT_GENDER,
    PATIENT_ADDRESS,
    PATIENT_TELECOM,
    ENCOUNTER_SET_ID,
    ENCOUNTER_CLASS,
    ENCOUNTER_LOCATION,
    ENCOUNTER_ATTENDING,
    OBSERVATION_EFFECTIVE,
    OBSERVATION_CODE,
    OBSERVATION_VALUE,
    OBSERVATION_UNIT,
    OBSERVATION_STATUS,
    ALLERGY_SET_ID,
    ALLERGY_TYPE,
    ALLERGY_CODE,
    ALLERGY_SEVERITY,
    ALLERGY_REACTION,
];
