//! Three-tier content resolution: editing value, then draft, then published,
//! then the caller's default.

use std::sync::Arc;

use folio_common::CacheConfig;
use folio_common::cache::TtlCache;
use tracing::debug;

use crate::error::PersistenceError;
use crate::model::{ContentBlock, DraftChanges, ProjectId, PublishedSnapshot};
use crate::store::PublishedStore;

/// Which tier a displayed value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Editing,
    Draft,
    Published,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub tier: Tier,
}

/// First present value wins, in tier order.
pub fn resolve_tiers<T>(
    editing: Option<T>,
    draft: Option<T>,
    published: Option<T>,
    default: T,
) -> Resolved<T> {
    if let Some(value) = editing {
        return Resolved {
            value,
            tier: Tier::Editing,
        };
    }
    if let Some(value) = draft {
        return Resolved {
            value,
            tier: Tier::Draft,
        };
    }
    if let Some(value) = published {
        return Resolved {
            value,
            tier: Tier::Published,
        };
    }
    Resolved {
        value: default,
        tier: Tier::Default,
    }
}

/// Read-through cache over the published tier.
///
/// Only published data is cached; drafts are always read from the store.
pub struct PublishedCache<P> {
    store: Arc<P>,
    cache: TtlCache<ProjectId, Option<Arc<PublishedSnapshot>>>,
}

impl<P> Clone for PublishedCache<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<P: PublishedStore> PublishedCache<P> {
    pub fn new(store: Arc<P>, config: &CacheConfig) -> Self {
        Self {
            store,
            cache: TtlCache::new(
                "published",
                config.published_capacity,
                config.published_ttl(),
            ),
        }
    }

    pub fn store(&self) -> &Arc<P> {
        &self.store
    }

    pub async fn get(
        &self,
        project: &ProjectId,
    ) -> Result<Option<Arc<PublishedSnapshot>>, PersistenceError> {
        if let Some(hit) = self.cache.get(project) {
            return Ok(hit);
        }
        let loaded = self
            .store
            .load_published(project)
            .await
            .map_err(|source| PersistenceError::LoadPublished {
                project: project.clone(),
                source,
            })?
            .map(Arc::new);
        debug!(project = %project, found = loaded.is_some(), "loaded published snapshot");
        self.cache.insert(project.clone(), loaded.clone());
        Ok(loaded)
    }

    pub fn put(&self, project: ProjectId, snapshot: Arc<PublishedSnapshot>) {
        self.cache.insert(project, Some(snapshot));
    }

    pub fn invalidate(&self, project: &ProjectId) {
        self.cache.invalidate(project);
    }

    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

/// Drafts and published data of one project, read together.
#[derive(Debug, Clone, Default)]
pub struct ContentSnapshot {
    pub drafts: DraftChanges,
    pub published: Option<Arc<PublishedSnapshot>>,
}

impl ContentSnapshot {
    pub fn text<'a>(
        &'a self,
        key: &str,
        editing: Option<&'a str>,
        default: &'a str,
    ) -> Resolved<&'a str> {
        resolve_tiers(
            editing,
            self.drafts.text_content.get(key).map(String::as_str),
            self.published
                .as_ref()
                .and_then(|p| p.text_content.get(key))
                .map(String::as_str),
            default,
        )
    }

    /// Current URL for an image reference. Defaults to the reference itself.
    pub fn image<'a>(&'a self, original_src: &'a str) -> Resolved<&'a str> {
        resolve_tiers(
            None,
            self.drafts.images.get(original_src).map(String::as_str),
            self.published
                .as_ref()
                .and_then(|p| p.images.get(original_src))
                .map(String::as_str),
            original_src,
        )
    }

    pub fn blocks<'a>(
        &'a self,
        section_key: &str,
        editing: Option<&'a [ContentBlock]>,
    ) -> Resolved<&'a [ContentBlock]> {
        resolve_tiers(
            editing,
            self.drafts
                .content_blocks
                .get(section_key)
                .map(Vec::as_slice),
            self.published
                .as_ref()
                .and_then(|p| p.content_blocks.get(section_key))
                .map(Vec::as_slice),
            <&[ContentBlock]>::default(),
        )
    }
}
