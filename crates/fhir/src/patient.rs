//! FHIR-aligned Patient resource.
//!
//! Demographics and identification for the subject of a message. The NHS number is carried
//! exactly as the source system declared it (body plus declared check digit); whether it is
//! valid is decided downstream.

use crate::datatypes::{Address, ContactPoint, HumanName, Identifier, NHS_NUMBER_SYSTEM};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name: Vec<HumanName>,

    /// `male | female | other | unknown`, or the untranslated source value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub telecom: Vec<ContactPoint>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
}

impl Patient {
    /// The first identifier issued under the NHS number system.
    pub fn nhs_number(&self) -> Option<&Identifier> {
        self.identifier
            .iter()
            .find(|i| i.system.as_deref() == Some(NHS_NUMBER_SYSTEM))
    }

    pub fn nhs_number_mut(&mut self) -> Option<&mut Identifier> {
        self.identifier
            .iter_mut()
            .find(|i| i.system.as_deref() == Some(NHS_NUMBER_SYSTEM))
    }

    /// The primary (first) name.
    pub fn primary_name(&self) -> Option<&HumanName> {
        self.name.first()
    }
}
