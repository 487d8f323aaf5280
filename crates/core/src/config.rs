//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into the pipeline. The core never reads process-wide environment variables itself;
//! binaries read them and hand the raw values to the `*_from_env_value` helpers below.

use crate::chaos::ChaosConfig;
use crate::constants::{
    ACCEPTED_DIR_NAME, DEFAULT_BATCH_SIZE, DEFAULT_CHAOS_DEFECTS, DEFAULT_CHAOS_RATE,
    DEFAULT_CHAOS_SEED, DEFAULT_DATA_DIR, INBOUND_DIR_NAME, LEDGER_FILENAME, RAW_DIR_NAME,
    REJECTED_DIR_NAME,
};
use crate::sentinel::rules::RuleCatalog;
use crate::{SentinelError, SentinelResult};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Core configuration resolved at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct CoreConfig {
    data_dir: PathBuf,
    batch_size: usize,
    chaos: ChaosConfig,
    disabled_rules: BTreeSet<String>,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::InvalidConfig`] if:
    /// - `batch_size` is zero,
    /// - the chaos infection rate is outside `0.0..=1.0`,
    /// - a disabled rule id is not in the rule catalog.
    pub fn new(
        data_dir: PathBuf,
        batch_size: usize,
        chaos: ChaosConfig,
        disabled_rules: BTreeSet<String>,
    ) -> SentinelResult<Self> {
        if batch_size == 0 {
            return Err(SentinelError::InvalidConfig(
                "batch_size must be at least 1".into(),
            ));
        }
        chaos.validate()?;
        RuleCatalog::standard().check_known(&disabled_rules)?;

        Ok(Self {
            data_dir,
            batch_size,
            chaos,
            disabled_rules,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn inbound_dir(&self) -> PathBuf {
        self.data_dir.join(INBOUND_DIR_NAME)
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join(RAW_DIR_NAME)
    }

    pub fn accepted_dir(&self) -> PathBuf {
        self.data_dir.join(ACCEPTED_DIR_NAME)
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.data_dir.join(REJECTED_DIR_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILENAME)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn chaos(&self) -> &ChaosConfig {
        &self.chaos
    }

    pub fn disabled_rules(&self) -> &BTreeSet<String> {
        &self.disabled_rules
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            chaos: ChaosConfig::default(),
            disabled_rules: BTreeSet::new(),
        }
    }
}

/// Trim an optional raw value, treating empty/whitespace as unset.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_value<T: FromStr>(name: &str, value: Option<String>, default: T) -> SentinelResult<T>
where
    T::Err: std::fmt::Display,
{
    match present(value) {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|e| SentinelError::InvalidConfig(format!("{name}={v:?}: {e}"))),
    }
}

/// Resolve the shared volume root. Unset or blank values fall back to [`DEFAULT_DATA_DIR`].
pub fn data_dir_from_env_value(value: Option<String>) -> PathBuf {
    present(value)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn batch_size_from_env_value(value: Option<String>) -> SentinelResult<usize> {
    parse_value("SENTINEL_BATCH_SIZE", value, DEFAULT_BATCH_SIZE)
}

/// Parse a chaos on/off switch: `1/true/on/yes` or `0/false/off/no` (case-insensitive).
pub fn chaos_enabled_from_env_value(value: Option<String>) -> SentinelResult<bool> {
    match present(value).map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "on" | "yes" => Ok(true),
            "0" | "false" | "off" | "no" => Ok(false),
            _ => Err(SentinelError::InvalidConfig(format!(
                "SENTINEL_CHAOS={v:?}: expected true or false"
            ))),
        },
    }
}

pub fn chaos_defects_from_env_value(value: Option<String>) -> SentinelResult<usize> {
    parse_value("SENTINEL_CHAOS_DEFECTS", value, DEFAULT_CHAOS_DEFECTS)
}

pub fn chaos_rate_from_env_value(value: Option<String>) -> SentinelResult<f64> {
    parse_value("SENTINEL_CHAOS_RATE", value, DEFAULT_CHAOS_RATE)
}

pub fn chaos_seed_from_env_value(value: Option<String>) -> SentinelResult<u64> {
    parse_value("SENTINEL_CHAOS_SEED", value, DEFAULT_CHAOS_SEED)
}

/// Parse a comma-separated list of rule ids. Ids are checked later by [`CoreConfig::new`].
pub fn disabled_rules_from_env_value(value: Option<String>) -> BTreeSet<String> {
    present(value)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Resolve a full [`CoreConfig`] from named raw values.
///
/// `lookup` maps a variable name (e.g. `SENTINEL_BATCH_SIZE`) to its raw value; binaries pass
/// `|name| std::env::var(name).ok()`.
///
/// # Errors
///
/// Returns [`SentinelError::InvalidConfig`] naming the first value that does not parse, or any
/// error from [`CoreConfig::new`].
pub fn core_config_from_lookup<F>(lookup: F) -> SentinelResult<CoreConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let chaos = ChaosConfig {
        enabled: chaos_enabled_from_env_value(lookup("SENTINEL_CHAOS"))?,
        defects_per_document: chaos_defects_from_env_value(lookup("SENTINEL_CHAOS_DEFECTS"))?,
        infection_rate: chaos_rate_from_env_value(lookup("SENTINEL_CHAOS_RATE"))?,
        seed: chaos_seed_from_env_value(lookup("SENTINEL_CHAOS_SEED"))?,
    };
    CoreConfig::new(
        data_dir_from_env_value(lookup("SENTINEL_DATA_DIR")),
        batch_size_from_env_value(lookup("SENTINEL_BATCH_SIZE"))?,
        chaos,
        disabled_rules_from_env_value(lookup("SENTINEL_DISABLED_RULES")),
    )
}
