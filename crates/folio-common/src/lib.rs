//! Shared plumbing for the folio crates: errors, configuration, caches,
//! telemetry and stage timing.

pub mod cache;
pub mod config;
pub mod error;
pub mod perf;
pub mod telemetry;

pub use crate::config::{
    CacheConfig, CaptionConfig, DraftConfig, FolioConfig, ImageConfig, StorageConfig,
};
pub use crate::error::{ConfigError, SerDeError};
