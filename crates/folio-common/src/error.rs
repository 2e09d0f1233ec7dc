//! Error types shared across folio crates.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    #[diagnostic(code(config::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    #[diagnostic(
        code(config::parse),
        help("sections are [drafts], [images], [captions], [cache] and [storage]")
    )]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {field}: {message}")]
    #[diagnostic(code(config::invalid))]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Serialization/deserialization errors
#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum SerDeError {
    #[error(transparent)]
    #[diagnostic(code(serde::json))]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code(serde::toml))]
    Toml(#[from] toml::de::Error),
}
