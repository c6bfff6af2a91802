//! Configuration loading.
//!
//! Settings come from an optional JSON file (`--config` or
//! `TUB_CONFIG_PATH`), then `TUB_MAX_SEGMENT_LEN` and `TUB_READ_STRATEGY`
//! override individual fields.

use crate::datastore::{DEFAULT_MAX_SEGMENT_LEN, DatastoreOptions};
use crate::error::{Error, Result};
use crate::line_file::ReadStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "TUB_CONFIG_PATH";
pub const MAX_SEGMENT_LEN_ENV: &str = "TUB_MAX_SEGMENT_LEN";
pub const READ_STRATEGY_ENV: &str = "TUB_READ_STRATEGY";

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Records per segment for newly created datastores.
    #[serde(alias = "maxSegmentLen", alias = "max_len")]
    pub max_segment_len: Option<u64>,

    #[serde(alias = "readStrategy")]
    pub read_strategy: Option<ReadStrategy>,

    /// `"key:value"` entries stored in new datastores.
    #[serde(alias = "userMetadata")]
    pub metadata: Vec<String>,
}

impl Config {
    /// Load from `config_path`, falling back to `TUB_CONFIG_PATH`, then
    /// apply environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(config_path, env_lookup)
    }

    pub fn load_with_env<F>(config_path: Option<&Path>, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| get_env(CONFIG_PATH_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::load_from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env(get_env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load settings from a specific path. A missing or blank file yields
    /// the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse settings file {}: {e}",
                path.display()
            ))
        })
    }

    fn apply_env<F>(&mut self, get_env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = get_env(MAX_SEGMENT_LEN_ENV) {
            let value = raw.trim().parse::<u64>().map_err(|e| {
                Error::config(format!("{MAX_SEGMENT_LEN_ENV}={raw:?} is not a count: {e}"))
            })?;
            self.max_segment_len = Some(value);
        }
        if let Some(raw) = get_env(READ_STRATEGY_ENV) {
            self.read_strategy = Some(raw.parse()?);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.max_segment_len == Some(0) {
            return Err(Error::validation("max_segment_len must be at least 1"));
        }
        Ok(())
    }

    pub fn max_segment_len(&self) -> u64 {
        self.max_segment_len.unwrap_or(DEFAULT_MAX_SEGMENT_LEN)
    }

    pub fn read_strategy(&self) -> ReadStrategy {
        self.read_strategy.unwrap_or_default()
    }

    /// Writable-open options carrying this configuration.
    pub fn datastore_options(&self) -> DatastoreOptions {
        DatastoreOptions::default()
            .with_metadata(self.metadata.iter().cloned())
            .with_max_segment_len(self.max_segment_len())
            .with_read_strategy(self.read_strategy())
    }
}

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}
