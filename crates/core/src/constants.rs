//! Constants used throughout the sentinel core crate.
//!
//! Directory and file names of the shared volume, plus defaults for runtime configuration.

/// Default root of the shared volume when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "data";

/// Directory name for inbound legacy messages (`*.hl7`).
pub const INBOUND_DIR_NAME: &str = "hl7_inbound";

/// Directory name for transformed bundles, one JSON file per message.
pub const RAW_DIR_NAME: &str = "raw";

/// Directory name for copies of bundles whose message was accepted.
pub const ACCEPTED_DIR_NAME: &str = "accepted";

/// Directory name for copies of bundles whose message was rejected.
pub const REJECTED_DIR_NAME: &str = "rejected";

/// Filename for the persisted defect ledger.
pub const LEDGER_FILENAME: &str = "defect_ledger.yaml";

/// File extension of inbound messages.
pub const INBOUND_EXTENSION: &str = "hl7";

/// Default maximum number of messages processed per run.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default number of defects requested per infected document.
pub const DEFAULT_CHAOS_DEFECTS: usize = 1;

/// Default probability that chaos infects a given document.
pub const DEFAULT_CHAOS_RATE: f64 = 0.4;

/// Default seed for the chaos injector.
pub const DEFAULT_CHAOS_SEED: u64 = 0x5EED;
