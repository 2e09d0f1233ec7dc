//! In-process backends, used by tests and by embedders that keep drafts elsewhere.

use std::collections::{BTreeMap, HashMap};

use smol_str::SmolStr;
use tokio::sync::RwLock;

use super::{DraftStore, PublishedStore};
use crate::error::StoreError;
use crate::model::{ChangeKind, ChangeRecord, DraftChanges, ProjectId, PublishedSnapshot};

type RecordMap = BTreeMap<(ChangeKind, SmolStr), ChangeRecord>;

#[derive(Debug, Default)]
pub struct MemoryDraftStore {
    projects: RwLock<HashMap<ProjectId, RecordMap>>,
}

impl MemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current records of a project, ordered by kind then key.
    pub async fn records(&self, project: &ProjectId) -> Vec<ChangeRecord> {
        self.projects
            .read()
            .await
            .get(project)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl DraftStore for MemoryDraftStore {
    async fn get_all_changes(&self, project: &ProjectId) -> Result<DraftChanges, StoreError> {
        let projects = self.projects.read().await;
        Ok(projects
            .get(project)
            .map(|records| DraftChanges::from_records(records.values()))
            .unwrap_or_default())
    }

    async fn list_changes(&self, project: &ProjectId) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(self.records(project).await)
    }

    async fn save_change(&self, record: &ChangeRecord) -> Result<(), StoreError> {
        self.projects
            .write()
            .await
            .entry(record.project_id.clone())
            .or_default()
            .insert((record.kind(), record.key.clone()), record.clone());
        Ok(())
    }

    async fn remove_changes(
        &self,
        project: &ProjectId,
        records: &[ChangeRecord],
    ) -> Result<usize, StoreError> {
        let mut projects = self.projects.write().await;
        let Some(stored) = projects.get_mut(project) else {
            return Ok(0);
        };
        let mut removed = 0;
        for record in records {
            let slot = (record.kind(), record.key.clone());
            if stored.get(&slot) == Some(record) {
                stored.remove(&slot);
                removed += 1;
            }
        }
        if stored.is_empty() {
            projects.remove(project);
        }
        Ok(removed)
    }

    async fn clear_changes(&self, project: &ProjectId) -> Result<(), StoreError> {
        self.projects.write().await.remove(project);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryPublishedStore {
    snapshots: RwLock<HashMap<ProjectId, PublishedSnapshot>>,
}

impl MemoryPublishedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(project: ProjectId, snapshot: PublishedSnapshot) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::from([(project, snapshot)])),
        }
    }
}

impl PublishedStore for MemoryPublishedStore {
    async fn load_published(
        &self,
        project: &ProjectId,
    ) -> Result<Option<PublishedSnapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(project).cloned())
    }

    async fn store_published(
        &self,
        project: &ProjectId,
        snapshot: &PublishedSnapshot,
    ) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(project.clone(), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeValue, ContentBlock};

    #[tokio::test]
    async fn test_same_key_different_kind_are_distinct() {
        let store = MemoryDraftStore::new();
        let project = ProjectId::new("p");
        store
            .save_change(&ChangeRecord::new(
                project.clone(),
                "intro",
                ChangeValue::Text("hello".into()),
            ))
            .await
            .unwrap();
        store
            .save_change(&ChangeRecord::new(
                project.clone(),
                "intro",
                ChangeValue::ContentBlock(vec![ContentBlock::text("a")]),
            ))
            .await
            .unwrap();

        let changes = store.get_all_changes(&project).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(store.records(&project).await.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_is_project_scoped() {
        let store = MemoryDraftStore::new();
        let a = ProjectId::new("a");
        let b = ProjectId::new("b");
        for project in [&a, &b] {
            store
                .save_change(&ChangeRecord::new(
                    project.clone(),
                    "title",
                    ChangeValue::Text("t".into()),
                ))
                .await
                .unwrap();
        }
        store.clear_changes(&a).await.unwrap();
        assert!(store.get_all_changes(&a).await.unwrap().is_empty());
        assert_eq!(store.get_all_changes(&b).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_keeps_records_rewritten_since_read() {
        let store = MemoryDraftStore::new();
        let project = ProjectId::new("p");
        for key in ["title", "subtitle"] {
            store
                .save_change(&ChangeRecord::new(
                    project.clone(),
                    key,
                    ChangeValue::Text("v1".into()),
                ))
                .await
                .unwrap();
        }
        let read = store.list_changes(&project).await.unwrap();
        let rewritten = ChangeRecord::new(project.clone(), "title", ChangeValue::Text("v2".into()));
        store.save_change(&rewritten).await.unwrap();

        assert_eq!(store.remove_changes(&project, &read).await.unwrap(), 1);
        assert_eq!(store.records(&project).await, vec![rewritten]);
    }
}
