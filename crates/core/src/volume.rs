//! Shared-volume adapter.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/
//!   hl7_inbound/        *.hl7 legacy messages (read only; never moved or deleted)
//!   raw/                one pretty JSON bundle per processed message
//!   accepted/           copy of each bundle whose message was accepted
//!   rejected/           copy of each bundle whose message was rejected
//!   defect_ledger.yaml  the defect ledger
//! ```

use crate::config::CoreConfig;
use crate::constants::INBOUND_EXTENSION;
use crate::sentinel::{DefectLedger, LedgerStore, Verdict};
use crate::{SentinelError, SentinelResult};
use fhir::Bundle;
use std::fs;
use std::path::{Path, PathBuf};

/// One inbound message: file stem and text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub name: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedVolume {
    inbound: PathBuf,
    raw: PathBuf,
    accepted: PathBuf,
    rejected: PathBuf,
    ledger: PathBuf,
}

impl SharedVolume {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            inbound: config.inbound_dir(),
            raw: config.raw_dir(),
            accepted: config.accepted_dir(),
            rejected: config.rejected_dir(),
            ledger: config.ledger_path(),
        }
    }

    pub fn inbound_dir(&self) -> &Path {
        &self.inbound
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw
    }

    pub fn ledger_path(&self) -> &Path {
        &self.ledger
    }

    /// Create every directory of the layout.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::DirCreation`] naming the directory that failed.
    pub fn ensure_layout(&self) -> SentinelResult<()> {
        for dir in [&self.inbound, &self.raw, &self.accepted, &self.rejected] {
            fs::create_dir_all(dir).map_err(|source| SentinelError::DirCreation {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Inbound message files, ordered by file name. A missing inbound directory is empty.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::FileRead`] if the directory cannot be listed.
    pub fn list_inbound(&self) -> SentinelResult<Vec<PathBuf>> {
        if !self.inbound.exists() {
            return Ok(Vec::new());
        }
        let read_err = |source| SentinelError::FileRead {
            path: self.inbound.clone(),
            source,
        };

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.inbound).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(INBOUND_EXTENSION)
            {
                files.push(path);
            }
        }
        files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(files)
    }

    /// Read one inbound file. Bytes that are not UTF-8 are replaced rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::FileRead`] if the file cannot be read.
    pub fn read_message(&self, path: &Path) -> SentinelResult<InboundMessage> {
        let bytes = fs::read(path).map_err(|source| SentinelError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(InboundMessage {
            name,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// Write `bundle` to `raw/<name>.json`, returning the path written.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError`] if rendering or writing fails.
    pub fn write_bundle(&self, name: &str, bundle: &Bundle) -> SentinelResult<PathBuf> {
        let json = bundle.render()?;
        let path = self.raw.join(format!("{name}.json"));
        fs::write(&path, json).map_err(|source| SentinelError::FileWrite {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Copy a raw bundle into `accepted/` or `rejected/`, removing any copy of the same name
    /// left in the other directory by an earlier run.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::FileWrite`] if the copy or the cleanup fails.
    pub fn file_verdict(&self, raw_path: &Path, verdict: Verdict) -> SentinelResult<PathBuf> {
        let (target_dir, other_dir) = match verdict {
            Verdict::Accepted => (&self.accepted, &self.rejected),
            Verdict::Rejected => (&self.rejected, &self.accepted),
        };
        let file_name = raw_path.file_name().unwrap_or_default();
        let target = target_dir.join(file_name);
        fs::copy(raw_path, &target).map_err(|source| SentinelError::FileWrite {
            path: target.clone(),
            source,
        })?;

        let stale = other_dir.join(file_name);
        if stale.exists() {
            fs::remove_file(&stale).map_err(|source| SentinelError::FileWrite {
                path: stale.clone(),
                source,
            })?;
        }
        Ok(target)
    }

    /// # Errors
    ///
    /// Returns [`SentinelError`] if an existing ledger file cannot be read or parsed.
    pub fn load_ledger(&self) -> SentinelResult<DefectLedger> {
        LedgerStore::load(&self.ledger)
    }

    /// # Errors
    ///
    /// Returns [`SentinelError`] if the ledger cannot be written.
    pub fn save_ledger(&self, ledger: &DefectLedger) -> SentinelResult<()> {
        LedgerStore::save(&self.ledger, ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::ChaosConfig;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn volume(dir: &TempDir) -> SharedVolume {
        let config = CoreConfig::new(
            dir.path().to_path_buf(),
            10,
            ChaosConfig::default(),
            BTreeSet::new(),
        )
        .expect("config");
        SharedVolume::from_config(&config)
    }

    #[test]
    fn lists_only_messages_in_name_order() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        assert!(volume.list_inbound().unwrap().is_empty());

        volume.ensure_layout().unwrap();
        for name in ["b.hl7", "a.hl7", "notes.txt", "c.HL7.bak"] {
            fs::write(volume.inbound_dir().join(name), "MSH|^~\\&|").unwrap();
        }
        fs::create_dir(volume.inbound_dir().join("d.hl7")).unwrap();

        let names: Vec<String> = volume
            .list_inbound()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.hl7", "b.hl7"]);
    }

    #[test]
    fn reads_messages_lossily() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        volume.ensure_layout().unwrap();
        let path = volume.inbound_dir().join("msg_001.hl7");
        fs::write(&path, b"MSH|^~\\&|\xff").unwrap();

        let message = volume.read_message(&path).unwrap();
        assert_eq!(message.name, "msg_001");
        assert!(message.text.starts_with("MSH|"));
        assert!(message.text.contains('\u{FFFD}'));
    }

    #[test]
    fn verdict_copy_moves_between_directories() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        volume.ensure_layout().unwrap();
        let bundle = Bundle::new("1", "ORU^R01");
        let raw = volume.write_bundle("msg_001", &bundle).unwrap();
        assert_eq!(raw, volume.raw_dir().join("msg_001.json"));

        let rejected = volume.file_verdict(&raw, Verdict::Rejected).unwrap();
        assert!(rejected.exists());

        let accepted = volume.file_verdict(&raw, Verdict::Accepted).unwrap();
        assert!(accepted.exists());
        assert!(!rejected.exists());
        assert_eq!(Bundle::parse(&fs::read_to_string(accepted).unwrap()).unwrap(), bundle);
    }

    #[test]
    fn ledger_round_trips_through_the_volume() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        let mut ledger = volume.load_ledger().unwrap();
        assert!(ledger.is_empty());
        ledger.begin_run();
        volume.save_ledger(&ledger).unwrap();
        assert_eq!(volume.load_ledger().unwrap(), ledger);
    }
}
