//! FHIR-aligned Observation resource.
//!
//! Vital signs arrive either as a stand-alone observation with a single `valueQuantity`
//! (heart rate) or as a panel whose measurements live in `component` (blood pressure).

use crate::datatypes::{CodeableConcept, Quantity, Reference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,

    /// `final | preliminary | corrected | ...`, or the untranslated source value.
    pub status: String,

    pub code: CodeableConcept,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Reference>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_date_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component: Vec<ObservationComponent>,
}

/// One measurement inside a panel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationComponent {
    pub code: CodeableConcept,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
}

impl Observation {
    pub fn has_code(&self, code: &str) -> bool {
        self.code.has_code(code)
    }

    /// The component carrying `code`, if any.
    pub fn component(&self, code: &str) -> Option<&ObservationComponent> {
        self.component.iter().find(|c| c.code.has_code(code))
    }

    /// The top-level numeric value, if present.
    pub fn value(&self) -> Option<f64> {
        self.value_quantity.as_ref().and_then(|q| q.value)
    }
}

impl ObservationComponent {
    pub fn value(&self) -> Option<f64> {
        self.value_quantity.as_ref().and_then(|q| q.value)
    }

    pub fn unit(&self) -> Option<&str> {
        self.value_quantity.as_ref().and_then(|q| q.unit.as_deref())
    }
}
