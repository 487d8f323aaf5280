//! FHIR-aligned resource documents for the legacy feed pipeline.
//!
//! This crate provides the **document model** the mapper produces and the auditor reads:
//! - resources: Patient, Observation, Encounter, AllergyIntolerance
//! - general datatypes (identifiers, names, codings, quantities, references)
//! - [`ClinicalDocument`]: one resource plus its [`MatchingKey`] and mapper annotations
//! - [`Bundle`]: every document produced from one source message
//!
//! This crate focuses on:
//! - FHIR semantic alignment (field names and nesting follow FHIR R4 JSON)
//! - serialisation/deserialisation, with schema mismatches reported by path
//!
//! It performs no terminology lookups and no validation of clinical content.

pub mod allergy;
pub mod datatypes;
pub mod document;
pub mod encounter;
pub mod observation;
pub mod patient;

pub use allergy::{AllergyIntolerance, AllergyReaction};
pub use datatypes::{
    Address, CodeableConcept, Coding, ContactPoint, HumanName, Identifier, NameUse, Quantity,
    Reference, NHS_NUMBER_SYSTEM,
};
pub use document::{
    Annotation, AnnotationKind, Bundle, ClinicalDocument, MatchingKey, Resource, ResourceType,
};
pub use encounter::{Encounter, EncounterLocation, EncounterParticipant};
pub use observation::{Observation, ObservationComponent};
pub use patient::Patient;

/// Errors returned by the `fhir` crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;
