//! YAML persistence for the [`DefectLedger`].
//!
//! Loading and saving are the ledger's only I/O. A missing ledger file is an empty ledger, so a
//! fresh volume needs no bootstrapping.

use crate::sentinel::ledger::{DefectLedger, LedgerError};
use crate::{SentinelError, SentinelResult};
use std::fs;
use std::path::Path;

pub struct LedgerStore;

impl LedgerStore {
    /// Strictly parse a ledger from YAML text.
    ///
    /// This uses `serde_path_to_error` to surface the path of the failing entry (e.g.
    /// `entries.100/Patient/9434767067.patient.nhs-number.checksum.status`).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Schema`] if the text does not match the ledger schema or the
    /// entries break the ledger's invariants.
    pub fn parse(yaml_text: &str) -> Result<DefectLedger, LedgerError> {
        if yaml_text.trim().is_empty() {
            return Ok(DefectLedger::new());
        }

        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let ledger: DefectLedger = match serde_path_to_error::deserialize(deserializer) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() || path == "." {
                    "<root>"
                } else {
                    path.as_str()
                };
                return Err(LedgerError::Schema(format!(
                    "ledger mismatch at {path}: {source}"
                )));
            }
        };

        ledger.check_consistency()?;
        Ok(ledger)
    }

    /// # Errors
    ///
    /// Returns [`SentinelError::YamlSerialization`] if serialisation fails.
    pub fn render(ledger: &DefectLedger) -> SentinelResult<String> {
        serde_yaml::to_string(ledger).map_err(SentinelError::YamlSerialization)
    }

    /// Load the ledger at `path`; a missing file yields an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError`] if the file cannot be read or does not parse.
    pub fn load(path: &Path) -> SentinelResult<DefectLedger> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no ledger file; starting empty");
            return Ok(DefectLedger::new());
        }
        let text = fs::read_to_string(path).map_err(|source| SentinelError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text)?)
    }

    /// Write the ledger to `path`, creating parent directories as needed.
    ///
    /// The text is written to a sibling temporary file and renamed into place, so a reader
    /// never sees a half-written ledger.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError`] if serialisation or any filesystem step fails.
    pub fn save(path: &Path, ledger: &DefectLedger) -> SentinelResult<()> {
        let yaml = Self::render(ledger)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SentinelError::DirCreation {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, yaml).map_err(|source| SentinelError::FileWrite {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| SentinelError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }
}
