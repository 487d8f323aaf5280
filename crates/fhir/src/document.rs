//! Clinical resource documents, matching keys and transaction bundles.
//!
//! A [`ClinicalDocument`] wraps one resource together with the identity used to correlate it
//! across independent pipeline runs (the [`MatchingKey`]) and the annotations the mapper left
//! where the source data could not be fully translated.
//!
//! Responsibilities:
//! - Define the document, annotation and bundle models
//! - Derive matching keys and deterministic resource ids
//! - Parse and render documents and bundles as JSON, reporting schema mismatches by path

use crate::allergy::AllergyIntolerance;
use crate::encounter::Encounter;
use crate::observation::Observation;
use crate::patient::Patient;
use crate::{FhirError, FhirResult};
use sentinel_types::NonEmptyText;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Matching key
// ============================================================================

/// Stable identity of a logical record: `"{message control id}/{resource type}/{business id}"`.
///
/// Built only from raw source fields, so the same record keeps the same key however its
/// translated content changes between runs.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchingKey(String);

impl MatchingKey {
    /// Builds a key from its three parts.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the control id or business id is blank.
    pub fn new(
        control_id: &str,
        resource_type: ResourceType,
        business_id: &str,
    ) -> FhirResult<Self> {
        let control_id = NonEmptyText::new(control_id)
            .map_err(|_| FhirError::InvalidInput("matching key needs a control id".into()))?;
        let business_id = NonEmptyText::new(business_id)
            .map_err(|_| FhirError::InvalidInput("matching key needs a business id".into()))?;
        Ok(Self(format!(
            "{control_id}/{}/{business_id}",
            resource_type.as_str()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic resource id for the record this key identifies (UUID v5, 32 hex chars).
    pub fn resource_id(&self) -> String {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, self.0.as_bytes())
            .simple()
            .to_string()
    }
}

impl fmt::Display for MatchingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for MatchingKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Resources
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Observation,
    Encounter,
    AllergyIntolerance,
}

impl ResourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceType::Patient => "Patient",
            ResourceType::Observation => "Observation",
            ResourceType::Encounter => "Encounter",
            ResourceType::AllergyIntolerance => "AllergyIntolerance",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resource, tagged by `resourceType` on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(Patient),
    Observation(Observation),
    Encounter(Encounter),
    AllergyIntolerance(AllergyIntolerance),
}

impl Resource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Patient(_) => ResourceType::Patient,
            Resource::Observation(_) => ResourceType::Observation,
            Resource::Encounter(_) => ResourceType::Encounter,
            Resource::AllergyIntolerance(_) => ResourceType::AllergyIntolerance,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Resource::Patient(r) => &r.id,
            Resource::Observation(r) => &r.id,
            Resource::Encounter(r) => &r.id,
            Resource::AllergyIntolerance(r) => &r.id,
        }
    }
}

// ============================================================================
// Annotations
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnnotationKind {
    /// A coded value outside the known terminology, passed through verbatim.
    CodingUnresolved,
    /// The source carried nothing for this destination.
    MissingValue,
    /// The source carried a value that could not be read (bad date, non-numeric value).
    UnparseableValue,
}

/// A note left by the mapper at `path` in the resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: AnnotationKind,
    pub path: String,
    pub detail: String,
}

// ============================================================================
// Document
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalDocument {
    pub matching_key: MatchingKey,
    pub source_message_id: String,
    pub mapping_version: String,
    pub resource: Resource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

impl ClinicalDocument {
    pub fn resource_type(&self) -> ResourceType {
        self.resource.resource_type()
    }

    pub fn annotate(&mut self, kind: AnnotationKind, path: &str, detail: impl Into<String>) {
        self.annotations.push(Annotation {
            kind,
            path: path.to_owned(),
            detail: detail.into(),
        });
    }

    pub fn as_patient(&self) -> Option<&Patient> {
        match &self.resource {
            Resource::Patient(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.resource {
            Resource::Observation(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_encounter(&self) -> Option<&Encounter> {
        match &self.resource {
            Resource::Encounter(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_allergy(&self) -> Option<&AllergyIntolerance> {
        match &self.resource {
            Resource::AllergyIntolerance(a) => Some(a),
            _ => None,
        }
    }

    /// Parse a document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] naming the failing path (for example
    /// `resource.valueQuantity.value`) when the JSON does not match the document schema.
    pub fn parse(json_text: &str) -> FhirResult<Self> {
        from_json(json_text, "ClinicalDocument")
    }

    /// Render the document as pretty-printed JSON.
    pub fn render(&self) -> FhirResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FhirError::Translation(format!("Failed to serialise document: {e}")))
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Every document produced from one source message, in mapping order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "BundleWire", try_from = "BundleWire")]
pub struct Bundle {
    /// MSH-10 of the source message.
    pub message_id: String,
    /// MSH-9 of the source message, e.g. `ORU^R01`.
    pub message_type: String,
    pub entry: Vec<ClinicalDocument>,
}

impl Bundle {
    pub fn new(message_id: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            message_type: message_type.into(),
            entry: Vec::new(),
        }
    }

    /// Parse a bundle from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError`] if:
    /// - the JSON does not match the bundle schema (reported with its path),
    /// - `resourceType` is not `"Bundle"`.
    pub fn parse(json_text: &str) -> FhirResult<Self> {
        from_json(json_text, "Bundle")
    }

    /// Render the bundle as pretty-printed JSON.
    pub fn render(&self) -> FhirResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| FhirError::Translation(format!("Failed to serialise bundle: {e}")))
    }

    pub fn find(&self, key: &str) -> Option<&ClinicalDocument> {
        self.entry.iter().find(|d| d.matching_key.as_str() == key)
    }
}

/// Wire representation of a bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleWire {
    resource_type: String,
    #[serde(rename = "type")]
    bundle_type: String,
    message_id: String,
    message_type: String,
    #[serde(default)]
    entry: Vec<ClinicalDocument>,
}

impl From<Bundle> for BundleWire {
    fn from(bundle: Bundle) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: "transaction".to_string(),
            message_id: bundle.message_id,
            message_type: bundle.message_type,
            entry: bundle.entry,
        }
    }
}

impl TryFrom<BundleWire> for Bundle {
    type Error = FhirError;

    fn try_from(wire: BundleWire) -> Result<Self, Self::Error> {
        if wire.resource_type != "Bundle" {
            return Err(FhirError::InvalidInput(format!(
                "Expected resourceType 'Bundle', got '{}'",
                wire.resource_type
            )));
        }
        Ok(Self {
            message_id: wire.message_id,
            message_type: wire.message_type,
            entry: wire.entry,
        })
    }
}

/// Deserialise `T` from JSON, surfacing the failing path on schema mismatch.
fn from_json<T: DeserializeOwned>(json_text: &str, what: &str) -> FhirResult<T> {
    let mut deserializer = serde_json::Deserializer::from_str(json_text);
    match serde_path_to_error::deserialize::<_, T>(&mut deserializer) {
        Ok(parsed) => {
            deserializer.end()?;
            Ok(parsed)
        }
        Err(err) => {
            let path = err.path().to_string();
            let source = err.into_inner();
            if source.is_syntax() || source.is_eof() {
                return Err(FhirError::InvalidJson(source));
            }
            let path = if path.is_empty() || path == "." {
                "<root>"
            } else {
                path.as_str()
            };
            Err(FhirError::Translation(format!(
                "{what} schema mismatch at {path}: {source}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::{HumanName, Identifier, NHS_NUMBER_SYSTEM};

    fn patient_document() -> ClinicalDocument {
        let key = MatchingKey::new("482913", ResourceType::Patient, "9434767067").expect("key");
        ClinicalDocument {
            source_message_id: "482913".into(),
            mapping_version: "test/1".into(),
            resource: Resource::Patient(Patient {
                id: key.resource_id(),
                identifier: vec![Identifier {
                    system: Some(NHS_NUMBER_SYSTEM.into()),
                    value: "9434767067".into(),
                }],
                name: vec![HumanName {
                    family: Some("SMITH".into()),
                    ..HumanName::default()
                }],
                gender: None,
                birth_date: None,
                telecom: vec![],
                address: vec![],
            }),
            matching_key: key,
            annotations: vec![],
        }
    }

    #[test]
    fn matching_key_joins_its_parts() {
        let key = MatchingKey::new("482913", ResourceType::Observation, "8867-4").expect("key");
        assert_eq!(key.as_str(), "482913/Observation/8867-4");
        assert_eq!(key.to_string(), "482913/Observation/8867-4");
    }

    #[test]
    fn matching_key_rejects_blank_parts() {
        assert!(matches!(
            MatchingKey::new(" ", ResourceType::Patient, "1"),
            Err(FhirError::InvalidInput(_))
        ));
        assert!(MatchingKey::new("1", ResourceType::Patient, "").is_err());
    }

    #[test]
    fn resource_ids_are_deterministic_per_key() {
        let a = MatchingKey::new("1", ResourceType::Patient, "9434767067").expect("key");
        let b = MatchingKey::new("1", ResourceType::Patient, "9434767067").expect("key");
        let c = MatchingKey::new("2", ResourceType::Patient, "9434767067").expect("key");
        assert_eq!(a.resource_id(), b.resource_id());
        assert_ne!(a.resource_id(), c.resource_id());
        assert_eq!(a.resource_id().len(), 32);
    }

    #[test]
    fn tags_resources_with_resource_type() {
        let json = serde_json::to_value(patient_document()).expect("serialise");
        assert_eq!(json["matchingKey"], "482913/Patient/9434767067");
        assert_eq!(json["resource"]["resourceType"], "Patient");
        assert!(json.get("annotations").is_none());
    }

    #[test]
    fn round_trips_documents_through_json() {
        let mut doc = patient_document();
        doc.annotate(AnnotationKind::MissingValue, "birthDate", "PID-7 is empty");
        let text = doc.render().expect("render");
        let reparsed = ClinicalDocument::parse(&text).expect("parse");
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn reports_schema_mismatch_with_path() {
        let text = r#"{"matchingKey":"1/Patient/2","sourceMessageId":"1","mappingVersion":"v",
            "resource":{"resourceType":"Patient","id":"x","name":[{"given":"not_an_array"}]}}"#;
        match ClinicalDocument::parse(text).expect_err("wrong type") {
            FhirError::Translation(msg) => {
                assert!(msg.starts_with("ClinicalDocument schema mismatch at resource"), "{msg}");
                assert!(msg.contains("expected a sequence"), "{msg}");
            }
            other => panic!("expected Translation error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_json_text() {
        assert!(matches!(
            ClinicalDocument::parse("{not json"),
            Err(FhirError::InvalidJson(_))
        ));
    }

    #[test]
    fn bundle_round_trips_and_checks_resource_type() {
        let mut bundle = Bundle::new("482913", "ADT^A01");
        bundle.entry.push(patient_document());
        let text = bundle.render().expect("render");
        assert!(text.contains("\"resourceType\": \"Bundle\""));
        assert!(text.contains("\"type\": \"transaction\""));

        let reparsed = Bundle::parse(&text).expect("parse");
        assert_eq!(reparsed, bundle);
        assert!(reparsed.find("482913/Patient/9434767067").is_some());

        let wrong = text.replace("\"resourceType\": \"Bundle\"", "\"resourceType\": \"List\"");
        let err = Bundle::parse(&wrong).expect_err("wrong resourceType");
        assert!(err.to_string().contains("List"), "{err}");
    }
}
