//! Runtime configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::extract::DEFAULT_PAGE_SIZE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Settings for one ETL invocation, typically read from a TOML file and
/// overridable per field on the command line.
#[derive(Debug, Clone, Deserialize)]
pub struct EtlConfig {
    /// Base URL of the upstream API serving the paginated endpoints.
    pub source_url: String,

    /// Path of the SQLite destination database.
    pub database: PathBuf,

    /// Records requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl EtlConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
