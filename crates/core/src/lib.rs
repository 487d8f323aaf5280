//! # Sentinel Core
//!
//! Core logic of the legacy feed transform-and-audit pipeline.
//!
//! This crate contains the pure pipeline stages and the thin shared-volume adapter around them:
//! - Mapping parsed legacy messages to clinical resource documents ([`mapper`])
//! - Seeded value-level corruption for stress testing ([`chaos`])
//! - Rule evaluation and the Active/Resolved defect ledger ([`sentinel`])
//! - Batch runs over the shared volume ([`pipeline`], [`volume`])
//!
//! **No API concerns**: argument parsing, scheduling and HTTP belong in the `sentinel` CLI and
//! the `sentinel-run` service.

pub mod chaos;
pub mod config;
pub mod constants;
pub mod error;
pub mod mapper;
pub mod mapping_table;
pub mod pipeline;
pub mod sentinel;
pub mod terminology;
pub mod volume;

#[cfg(test)]
mod testing;

pub use chaos::{ChaosConfig, ChaosManifest, ChaosRequest, DefectKind};
pub use config::CoreConfig;
pub use error::{MappingError, SentinelError, SentinelResult};
pub use mapper::map_message;
pub use pipeline::{execute_run, Outcome, Pipeline, RunReport, RunSummary};
pub use sentinel::{
    AuditContext, AuditReport, Defect, DefectLedger, DefectStatus, LedgerError, LedgerStore,
    RunId, Sentinel, Severity, Verdict,
};
pub use volume::SharedVolume;
