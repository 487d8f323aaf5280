//! Closed-set terminology translation.
//!
//! Every lookup returns `None` for a value outside its set; callers pass such values through
//! verbatim and annotate them as unresolved.

use fhir::Coding;

pub const LOINC_SYSTEM: &str = "http://loinc.org";
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";
pub const ICD10_SYSTEM: &str = "http://hl7.org/fhir/sid/icd-10";
pub const ACT_CODE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";
pub const ALLERGY_CLINICAL_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/allergyintolerance-clinical";
pub const ALLERGY_VERIFICATION_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/allergyintolerance-verification";

pub const HEART_RATE: &str = "8867-4";
pub const SYSTOLIC_BP: &str = "8480-6";
pub const DIASTOLIC_BP: &str = "8462-4";
pub const BLOOD_PRESSURE_PANEL: &str = "85354-9";

/// Display unit expected on heart-rate quantities.
pub const HEART_RATE_UNIT: &str = "beats/minute";
/// Display unit expected on blood-pressure quantities.
pub const BLOOD_PRESSURE_UNIT: &str = "mmHg";

/// Administrative sex (`PID-8`) → FHIR gender.
pub fn gender(code: &str) -> Option<&'static str> {
    match code {
        "M" => Some("male"),
        "F" => Some("female"),
        "O" => Some("other"),
        "U" => Some("unknown"),
        _ => None,
    }
}

/// LOINC vital-sign codes this pipeline understands.
pub fn vital_sign(code: &str) -> Option<Coding> {
    let display = match code {
        HEART_RATE => "Heart rate",
        SYSTOLIC_BP => "Systolic blood pressure",
        DIASTOLIC_BP => "Diastolic blood pressure",
        BLOOD_PRESSURE_PANEL => "Blood pressure panel",
        _ => return None,
    };
    Some(Coding {
        system: Some(LOINC_SYSTEM.into()),
        code: Some(code.into()),
        display: Some(display.into()),
    })
}

/// A UCUM unit: `(display unit, UCUM code)`.
pub fn unit(code: &str) -> Option<(&'static str, &'static str)> {
    match code {
        "/min" => Some((HEART_RATE_UNIT, "/min")),
        "mm[Hg]" | "mmHg" => Some((BLOOD_PRESSURE_UNIT, "mm[Hg]")),
        _ => None,
    }
}

/// Coding-system suffix used in legacy coded elements (`CODE^TEXT^SYSTEM`).
pub fn coding_system(suffix: &str) -> Option<&'static str> {
    match suffix {
        "LN" => Some(LOINC_SYSTEM),
        "CD" | "I10" => Some(ICD10_SYSTEM),
        _ => None,
    }
}

/// Patient class (`PV1-2`) → encounter class coding.
pub fn patient_class(code: &str) -> Option<Coding> {
    let (act_code, display) = match code {
        "I" => ("IMP", "inpatient encounter"),
        "E" => ("EMER", "emergency"),
        "O" => ("AMB", "ambulatory"),
        _ => return None,
    };
    Some(Coding {
        system: Some(ACT_CODE_SYSTEM.into()),
        code: Some(act_code.into()),
        display: Some(display.into()),
    })
}

/// Trigger event (`MSH-9.2`) → encounter status.
pub fn encounter_status(trigger: &str) -> Option<&'static str> {
    match trigger {
        "A01" | "A08" => Some("in-progress"),
        "A03" => Some("finished"),
        _ => None,
    }
}

/// Observation result status (`OBX-11`).
pub fn observation_status(code: &str) -> Option<&'static str> {
    match code {
        "F" => Some("final"),
        "P" => Some("preliminary"),
        "C" => Some("corrected"),
        "X" => Some("cancelled"),
        _ => None,
    }
}

/// Allergy type (`AL1-2`) → allergy category.
pub fn allergy_category(code: &str) -> Option<&'static str> {
    match code {
        "DA" => Some("medication"),
        "FA" => Some("food"),
        "MA" => Some("medication"),
        "EA" => Some("environment"),
        _ => None,
    }
}

/// Allergy severity (`AL1-4`) → `(criticality, reaction severity)`.
pub fn allergy_severity(code: &str) -> Option<(&'static str, &'static str)> {
    match code {
        "SV" => Some(("high", "severe")),
        "MO" => Some(("low", "moderate")),
        "MI" => Some(("low", "mild")),
        _ => None,
    }
}

/// ICD-10 allergen codes with their canonical display.
pub fn allergen(code: &str) -> Option<&'static str> {
    match code {
        "Z88.0" => Some("Allergy status to penicillin"),
        "Z91.01" => Some("Food allergy status"),
        "Y45.1" => Some("Salicylates"),
        "Z91.04" => Some("Nonmedicinal substance allergy status"),
        _ => None,
    }
}
