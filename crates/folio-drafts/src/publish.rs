//! Promote drafts to the published tier, or throw them away.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::client::ChangeStore;
use crate::error::{DraftError, PersistenceError};
use crate::events::DraftEvent;
use crate::model::{DraftChanges, PublishedSnapshot};
use crate::resolve::PublishedCache;
use crate::store::{DraftStore, PublishedStore};

pub struct Publisher<S, P> {
    store: ChangeStore<S>,
    published: PublishedCache<P>,
}

impl<S, P> Publisher<S, P>
where
    S: DraftStore + 'static,
    P: PublishedStore + 'static,
{
    pub fn new(store: ChangeStore<S>, published: PublishedCache<P>) -> Self {
        Self { store, published }
    }

    /// Overlay the current drafts on the published snapshot, store it and
    /// delete the drafts that went into it.
    ///
    /// Drafts written while the publish runs are not part of the snapshot and
    /// stay as drafts. The snapshot is stored before anything is deleted, so a
    /// failure in between leaves drafts that merely repeat what is published.
    pub async fn publish(&self) -> Result<Arc<PublishedSnapshot>, DraftError> {
        let project = self.store.project().clone();
        let records = self.store.list_records().await?;
        let drafts = DraftChanges::from_records(&records);
        let base = self
            .published
            .store()
            .load_published(&project)
            .await
            .map_err(|source| PersistenceError::LoadPublished {
                project: project.clone(),
                source,
            })?
            .unwrap_or_default();

        let snapshot = Arc::new(base.overlay(&drafts));
        self.published
            .store()
            .store_published(&project, &snapshot)
            .await
            .map_err(|source| PersistenceError::Publish {
                project: project.clone(),
                source,
            })?;
        let removed = self.store.remove_records(&records).await?;
        self.published.put(project.clone(), snapshot.clone());

        let kept = records.len().saturating_sub(removed);
        info!(project = %project, published = records.len(), kept, "published project");
        metrics::counter!("folio_publishes_total").increment(1);
        self.store.events().emit(DraftEvent::Published {
            project_id: project,
            snapshot: snapshot.clone(),
            timestamp: Utc::now(),
        });
        Ok(snapshot)
    }

    /// Delete every draft. Content resolves to the published snapshot again.
    pub async fn clear_drafts(&self) -> Result<(), DraftError> {
        let project = self.store.project().clone();
        self.store.clear().await?;
        info!(project = %project, "cleared drafts");
        self.store.events().emit(DraftEvent::DraftsCleared {
            project_id: project,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
