//! Error types for the focusgate daemon.

use std::io;

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::directory::loader::LoadError;
use crate::store::StoreError;

/// Main error type for focusgate operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("rule directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("site list error: {0}")]
    SiteList(#[from] LoadError),

    #[error("bypass store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors for configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("site entry cannot be empty")]
    EmptySite,

    #[error("wildcard site entries are not supported: {site:?}")]
    WildcardSite { site: String },

    #[error("duplicate site entry: {site:?}")]
    DuplicateSite { site: String },

    #[error("sites_file path cannot be empty")]
    EmptySitesFile,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
