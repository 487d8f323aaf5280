//! FHIR-aligned AllergyIntolerance resource.

use crate::datatypes::{CodeableConcept, Reference};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllergyIntolerance {
    pub id: String,

    pub clinical_status: CodeableConcept,

    pub verification_status: CodeableConcept,

    /// `allergy | intolerance`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub allergy_type: Option<String>,

    /// `food | medication | environment | biologic`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<String>,

    /// `low | high | unable-to-assess`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,

    /// The allergen. Absent when the source carried no allergen code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeableConcept>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient: Option<Reference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reaction: Vec<AllergyReaction>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllergyReaction {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifestation: Vec<CodeableConcept>,

    /// `mild | moderate | severe`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl AllergyIntolerance {
    /// `true` when the allergen carries at least one coded value.
    pub fn has_allergen_code(&self) -> bool {
        self.code
            .as_ref()
            .is_some_and(|c| c.coding.iter().any(|coding| coding.code.is_some()))
    }

    /// `true` when the allergy links to a patient resource.
    pub fn has_patient_link(&self) -> bool {
        self.patient
            .as_ref()
            .is_some_and(|p| p.reference.as_deref().is_some_and(|r| !r.is_empty()))
    }
}
