use crate::sentinel::ledger::LedgerError;

/// Identity failure: the message cannot express a distinguishable record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot map {field}: {reason}")]
pub struct MappingError {
    /// Source location, e.g. `PID-3.1`.
    pub field: String,
    pub reason: String,
}

impl MappingError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SentinelError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to create directory {path}: {source}", path = path.display())]
    DirCreation {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}", path = path.display())]
    FileRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}", path = path.display())]
    FileWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize YAML: {0}")]
    YamlSerialization(serde_yaml::Error),

    #[error("document error: {0}")]
    Fhir(#[from] fhir::FhirError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub type SentinelResult<T> = std::result::Result<T, SentinelError>;
