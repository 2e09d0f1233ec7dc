//! Process-local cache of image assets, keyed by original reference.

use std::sync::Arc;

use dashmap::DashMap;
use folio_common::CacheConfig;
use folio_common::cache::TtlCache;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub original_src: SmolStr,
    pub stored_url: Option<String>,
    pub caption: Option<String>,
    /// True while any pipeline stage, captioning included, is still running.
    pub is_processing: bool,
    pub error: Option<String>,
    /// blake3 of the uploaded bytes, hex encoded.
    pub content_hash: String,
}

impl ImageAsset {
    pub(crate) fn processing(original_src: SmolStr, content_hash: String, caption: Option<String>) -> Self {
        Self {
            original_src,
            stored_url: None,
            caption,
            is_processing: true,
            error: None,
            content_hash,
        }
    }

    /// Whether this asset already covers an upload of `content_hash`.
    pub fn satisfies(&self, content_hash: &str) -> bool {
        self.content_hash == content_hash && self.stored_url.is_some() && self.error.is_none()
    }
}

/// Asset entries plus one lane per source, so concurrent replacements of the
/// same source run one at a time and the second can reuse the first.
#[derive(Clone)]
pub struct AssetCache {
    entries: TtlCache<SmolStr, ImageAsset>,
    lanes: Arc<DashMap<SmolStr, Arc<Mutex<()>>>>,
}

impl AssetCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: TtlCache::new("image_assets", config.asset_capacity, config.asset_ttl()),
            lanes: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, original_src: &str) -> Option<ImageAsset> {
        self.entries.get(&SmolStr::new(original_src))
    }

    pub(crate) fn insert(&self, asset: ImageAsset) {
        self.entries.insert(asset.original_src.clone(), asset);
    }

    /// Apply `f` to the entry if it still exists.
    pub(crate) fn update(&self, original_src: &str, f: impl FnOnce(&mut ImageAsset)) -> Option<ImageAsset> {
        let mut asset = self.get(original_src)?;
        f(&mut asset);
        self.insert(asset.clone());
        Some(asset)
    }

    /// Wait for exclusive use of `original_src`.
    pub(crate) async fn turn(&self, original_src: &str) -> LaneTurn {
        let key = SmolStr::new(original_src);
        let lane = self.lanes.entry(key.clone()).or_default().clone();
        let guard = lane.clone().lock_owned().await;
        LaneTurn {
            lanes: self.lanes.clone(),
            key,
            lane,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

/// Exclusive turn on one source. The lane leaves the map once the last turn
/// on it ends and nobody is waiting.
pub(crate) struct LaneTurn {
    lanes: Arc<DashMap<SmolStr, Arc<Mutex<()>>>>,
    key: SmolStr,
    lane: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LaneTurn {
    fn drop(&mut self) {
        self.guard.take();
        // the map's handle plus ours
        self.lanes.remove_if(&self.key, |_, lane| {
            Arc::ptr_eq(lane, &self.lane) && Arc::strong_count(lane) == 2
        });
    }
}
