//! Engine configuration.
//!
//! Loaded from a TOML file. `$VAR` occurrences are replaced with the value of
//! the matching environment variable before parsing, so secrets and paths can
//! be injected by the deployment. Every section and field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FolioConfig {
    pub drafts: DraftConfig,
    pub images: ImageConfig,
    pub captions: CaptionConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

/// Field editor, block manager and sync watchdog settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DraftConfig {
    /// Quiet period before a debounced field write fires.
    pub debounce_ms: u64,
    /// Ceiling for one serialized block collection.
    pub max_block_bytes: usize,
    /// How long a write may stay in flight before the sync is reported stuck.
    pub watchdog_secs: u64,
}

impl Default for DraftConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            max_block_bytes: 512 * 1024,
            watchdog_secs: 30,
        }
    }
}

impl DraftConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_secs(self.watchdog_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    /// Uploads above this size are rejected before any work starts.
    pub max_upload_bytes: usize,
    /// Size budget the compressor aims for.
    pub target_bytes: usize,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 20 * 1024 * 1024,
            target_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CaptionConfig {
    /// Pause between two caption requests.
    pub delay_ms: u64,
    /// Captions shorter than this are considered placeholders.
    pub min_caption_len: usize,
    /// Attempts per item within one pass.
    pub attempts: u32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1500,
            min_caption_len: 20,
            attempts: 1,
        }
    }
}

impl CaptionConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub published_ttl_secs: u64,
    pub published_capacity: u64,
    pub asset_ttl_secs: u64,
    pub asset_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            published_ttl_secs: 300,
            published_capacity: 64,
            asset_ttl_secs: 3600,
            asset_capacity: 512,
        }
    }
}

impl CacheConfig {
    pub fn published_ttl(&self) -> Duration {
        Duration::from_secs(self.published_ttl_secs)
    }

    pub fn asset_ttl(&self) -> Duration {
        Duration::from_secs(self.asset_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the file-backed draft and published stores.
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./folio-data"),
        }
    }
}

impl FolioConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&substitute_env(&raw, env::vars())).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: FolioConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.images.target_bytes > self.images.max_upload_bytes {
            return Err(ConfigError::Invalid {
                field: "images.target_bytes",
                message: format!(
                    "target {} exceeds upload ceiling {}",
                    self.images.target_bytes, self.images.max_upload_bytes
                ),
            });
        }
        if self.drafts.max_block_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "drafts.max_block_bytes",
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// Replace `$NAME` with the value of each given variable.
fn substitute_env(raw: &str, vars: impl IntoIterator<Item = (String, String)>) -> String {
    let mut vars: Vec<_> = vars.into_iter().collect();
    // longest names first so $FOLIO_DIR_X isn't eaten by $FOLIO_DIR
    vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let mut out = raw.to_owned();
    for (k, v) in vars {
        out = out.replace(&format!("${}", k), &v);
    }
    out
}
